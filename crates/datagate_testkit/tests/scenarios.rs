//! Acceptance scenarios over the request surface.

use datagate_testkit::prelude::*;

#[test]
fn insert_and_get_a_report() {
    let store = TestStore::memory(REPORT);
    let created = store.post("/report", json!({"status": "ok", "count": 42}));
    assert_eq!(created.status, 201, "{}", created.text());
    let created = created.to_json().unwrap();
    let id = created["_id"].as_str().unwrap();
    assert!(created["_revision"].is_string());

    let got = store.get_json(&format!("/report/{id}"));
    assert_eq!(got["_id"], created["_id"]);
    assert_eq!(got["_revision"], created["_revision"]);
    assert_eq!(got["status"], "ok");
    assert_eq!(got["count"], 42);
    assert_eq!(got["notes"], json!([]));
    assert_eq!(got["revision"], Value::Null);
    assert_eq!(got["valid_from_date"], Value::Null);
    assert!(got.get("secret").is_none());
}

#[test]
fn paged_keyset_read() {
    let store = TestStore::memory(CITIES);
    for i in 1..=12 {
        store.insert_json("/city", json!({"id": i, "name": format!("city{i}"), "code": format!("c{i}")}));
    }

    let ids = |body: &Value| -> Vec<i64> {
        data(body).iter().map(|r| r["id"].as_i64().unwrap()).collect()
    };

    let first = store.get_json("/city?page(size:6)&sort(id)");
    assert_eq!(ids(&first), (1..=6).collect::<Vec<_>>());
    let next = first["_page"]["next"].as_str().unwrap().to_string();

    let second = store.get_json(&format!("/city?page(\"{next}\",size:6)&sort(id)"));
    assert_eq!(ids(&second), (7..=12).collect::<Vec<_>>());
    let next = second["_page"]["next"].as_str().unwrap().to_string();

    let third = store.get_json(&format!("/city?page(\"{next}\",size:6)&sort(id)"));
    assert!(data(&third).is_empty());
    assert_eq!(third["_page"]["next"], Value::Null);
}

#[test]
fn revision_conflict() {
    let store = TestStore::memory(REPORT);
    let created = store.insert_json("/report", json!({"status": "ok"}));
    let id = created["_id"].as_str().unwrap();

    let response = store.patch(&format!("/report/{id}"), json!({"_revision": "bogus", "status": "failed"}));
    assert_eq!(response.status, 409);
    let body = response.to_json().unwrap();
    let error = &body["errors"][0];
    assert_eq!(error["code"], "ConflictingValue");
    assert_eq!(error["context"]["given"], "bogus");
    assert_eq!(error["context"]["expected"], created["_revision"]);
    assert_eq!(error["context"]["model"], "report");
}

#[test]
fn nested_search_with_recurse() {
    let store = TestStore::memory(REPORT);
    store.insert_json("/report", json!({"status": "first", "notes": [{"note": "hello"}]}));
    store.insert_json("/report", json!({"status": "second", "notes": [{"note": "foo bar"}]}));

    let found = store.get_json("/report?recurse(note)=%22foo%20bar%22");
    let rows = data(&found);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "second");
}

#[test]
fn array_with_intermediate_join() {
    let store = TestStore::memory(COUNTRY_LANGUAGE);
    let lt = store.insert_id("/example/Language", json!({"code": "lt"}));
    let en = store.insert_id("/example/Language", json!({"code": "en"}));
    let country = store.insert_id("/example/Country", json!({"name": "Lithuania"}));
    for language in [&lt, &en] {
        store.insert_json(
            "/example/Country_Language",
            json!({"country": {"_id": country}, "language": {"_id": language}}),
        );
    }

    let listed = store.get_json("/example/Country");
    let rows = data(&listed);
    assert_eq!(rows.len(), 1);
    let mut languages: Vec<Value> = rows[0]["languages"].as_array().unwrap().clone();
    languages.sort_by_key(|l| l["_id"].as_str().unwrap().to_string());
    let mut expected = vec![json!({"_id": lt}), json!({"_id": en})];
    expected.sort_by_key(|l| l["_id"].as_str().unwrap().to_string());
    assert_eq!(languages, expected);
}

#[test]
fn page_size_guard() {
    let store = TestStore::memory(CITIES);
    store.insert_json("/city", json!({"id": 1, "name": null, "code": null}));

    let response = store.get("/city?sort(id)&page(size:2)");
    assert_eq!(response.status, 400);
    let body = response.to_json().unwrap();
    assert_eq!(body["errors"][0]["code"], "TooShortPageSize");
    assert_eq!(body["errors"][0]["context"]["size"], 2);
    assert_eq!(body["errors"][0]["context"]["min"], 4);
}

#[test]
fn level_three_and_four_refs() {
    let store = TestStore::memory(COUNTRY_CITY);
    let lt = store.insert_id("/country", json!({"code": "lt", "name": "Lithuania"}));
    store.insert_json("/city3", json!({"name": "Vilnius", "country": {"_id": lt}}));
    store.insert_json("/city4", json!({"name": "Vilnius", "country": {"_id": lt}}));

    let level3 = store.get_json("/city3");
    assert_eq!(data(&level3)[0]["country"], json!({"_id": lt}));

    let level4 = store.get_json("/city4");
    let country = &data(&level4)[0]["country"];
    assert_eq!(country["_id"], json!(lt));
    assert_eq!(country["code"], "lt");
    assert_eq!(country["name"], "Lithuania");
}

#[test]
fn files_survive_on_disk() {
    let store = TestStore::file(REPORT);
    let created = store.insert_json("/report", json!({"status": "ok"}));
    let id = created["_id"].as_str().unwrap();

    let upload = Request::new(Method::Put, format!("/report/{id}/pdf"))
        .body(b"%PDF-1.7".to_vec(), "application/pdf")
        .header("revision", created["_revision"].as_str().unwrap())
        .header("content-disposition", "attachment; filename=\"report.pdf\"");
    assert_eq!(store.handle(upload).status, 200);

    let download = store.get(&format!("/report/{id}/pdf"));
    assert_eq!(download.body, b"%PDF-1.7");
    assert!(store.files_path().unwrap().exists());
}

#[test]
fn change_log_keeps_hidden_values_out() {
    let store = TestStore::memory(REPORT);
    let created = store.insert_json("/report", json!({"status": "ok", "secret": "s3cret"}));
    let id = created["_id"].as_str().unwrap();
    let patched = store.patch(
        &format!("/report/{id}"),
        json!({"_revision": created["_revision"], "secret": "0ther", "count": 2}),
    );
    assert_eq!(patched.status, 200, "{}", patched.text());

    let response = store.get("/report/:changes");
    assert_eq!(response.status, 200);
    assert!(!response.text().contains("s3cret"));
    assert!(!response.text().contains("0ther"));
    let body = response.to_json().unwrap();
    let entries = data(&body);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["diff"]["status"], "ok");
    assert!(entries[0]["diff"].get("secret").is_none());
    assert_eq!(entries[1]["diff"], json!({"count": 2}));
}
