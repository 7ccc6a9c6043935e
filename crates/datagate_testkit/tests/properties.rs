//! Property tests for invariants that hold across inputs.

use datagate_core::geometry::Geometry;
use datagate_expr::{parse, unparse};
use datagate_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

proptest! {
    #[test]
    fn unparse_reparses_to_the_same_tree(source in expr_source_strategy()) {
        let tree = parse(&source).unwrap();
        let text = unparse(&tree);
        prop_assert_eq!(parse(&text).unwrap(), tree, "{} -> {}", source, text);
    }

    #[test]
    fn flip_twice_is_identity(g in geometry_strategy()) {
        prop_assert_eq!(g.flip().flip(), g);
    }

    #[test]
    fn parsed_points_flip_back(wkt in point_wkt_strategy()) {
        let (_, g) = Geometry::parse(&wkt).unwrap();
        prop_assert_eq!(g.flip().flip(), g);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_matches_set_membership((candidates, sample) in value_set_strategy()) {
        let store = TestStore::memory(REPORT);
        for count in [sample, sample + 100] {
            store.insert_json("/report", json!({"status": "ok", "count": count}));
        }
        let list = candidates.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        let body = store.get_json(&format!("/report?any(eq,count,{list})"));
        let found: BTreeSet<i64> = data(&body).iter().map(|r| r["count"].as_i64().unwrap()).collect();

        let expected: BTreeSet<i64> = [sample, sample + 100]
            .into_iter()
            .filter(|c| candidates.contains(c))
            .collect();
        prop_assert_eq!(found, expected);
    }

    #[test]
    fn revisions_chain_and_changes_cover_every_write(
        payloads in prop::collection::vec(report_payload_strategy(), 1..6),
    ) {
        let store = TestStore::memory(REPORT);
        let created = store.insert_json("/report", json!({"status": "new", "count": -1}));
        let id = created["_id"].as_str().unwrap().to_string();
        let mut revision = created["_revision"].clone();
        let mut writes = 1;

        for (i, payload) in payloads.into_iter().enumerate() {
            let mut body = payload;
            body["count"] = json!(i);
            body["_revision"] = revision.clone();
            let response = store.patch(&format!("/report/{id}"), body);
            prop_assert_eq!(response.status, 200, "{}", response.text());
            let echoed = response.to_json().unwrap()["_revision"].clone();
            prop_assert_ne!(&echoed, &revision);

            let stored = store.get_json(&format!("/report/{id}"));
            prop_assert_eq!(&stored["_revision"], &echoed);

            let stale = json!({"_revision": revision, "count": 1000});
            let rejected = store.patch(&format!("/report/{id}"), stale);
            prop_assert_eq!(rejected.status, 409);

            revision = echoed;
            writes += 1;
        }

        let changes = store.get_json("/report/:changes");
        prop_assert_eq!(data(&changes).len(), writes);
    }

    #[test]
    fn hidden_properties_stay_hidden(payload in report_payload_strategy(), explicit in any::<bool>()) {
        let store = TestStore::memory(REPORT);
        let mut body = payload;
        body["secret"] = json!("s3cret");
        let id = store.insert_id("/report", body);

        let path = if explicit { "/report?select(status,count)" } else { "/report" };
        let listed = store.get_json(path);
        for row in data(&listed) {
            prop_assert!(row.get("secret").is_none());
        }
        let path = format!("/report/{id}");
        let one = store.get_json(&path);
        prop_assert!(one.get("secret").is_none());
        let text = store.get(&path).text();
        prop_assert!(!text.contains("s3cret"));
    }
}
