//! Property-based test generators using proptest.
//!
//! Provides strategies for expression source text, geometries and row
//! values that stay inside what the parsers and manifests accept.

use datagate_core::geometry::{Coord, Geometry};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for identifiers that are not keywords.
pub fn ident_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,8}")
        .expect("Invalid regex")
        .prop_filter("Keywords are not identifiers", |s| {
            !matches!(s.as_str(), "null" | "true" | "false")
        })
}

/// Strategy for dotted property names such as `notes.note`.
pub fn bind_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(ident_strategy(), 1..3).prop_map(|parts| parts.join("."))
}

/// Strategy for literal source text: numbers, strings and keywords.
pub fn literal_source_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        (0i64..100_000).prop_map(|n| n.to_string()),
        (0u32..1000, 1u32..100).prop_map(|(int, frac)| format!("{int}.{frac}")),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,8}")
            .expect("Invalid regex")
            .prop_map(|s| format!("\"{s}\"")),
        Just("null".to_string()),
        Just("true".to_string()),
        Just("false".to_string()),
    ]
}

fn atom_source_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => bind_path_strategy(),
        3 => literal_source_strategy(),
        1 => ident_strategy().prop_map(|name| format!("-{name}")),
        1 => ident_strategy().prop_map(|name| format!("{name}.lower()")),
    ]
}

fn comparison_source_strategy() -> impl Strategy<Value = String> {
    let op = prop::sample::select(vec!["=", "!=", "<", "<=", ">", ">="]);
    (bind_path_strategy(), op, literal_source_strategy())
        .prop_map(|(left, op, right)| format!("{left}{op}{right}"))
}

/// Strategy for expression source text the parser accepts: comparisons,
/// calls with positional and keyword arguments, `&`, `|` and `!`.
pub fn expr_source_strategy() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        2 => comparison_source_strategy(),
        1 => atom_source_strategy(),
    ];
    leaf.prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 2..4)
                .prop_map(|parts| parts.iter().map(|p| format!("({p})")).collect::<Vec<_>>().join("&")),
            prop::collection::vec(inner.clone(), 2..4)
                .prop_map(|parts| parts.iter().map(|p| format!("({p})")).collect::<Vec<_>>().join("|")),
            inner.clone().prop_map(|p| format!("!({p})")),
            (
                ident_strategy(),
                prop::collection::vec(inner.clone(), 0..3),
                prop::option::of((ident_strategy(), literal_source_strategy())),
            )
                .prop_map(|(name, args, kwarg)| {
                    let mut args = args;
                    if let Some((key, value)) = kwarg {
                        args.push(format!("{key}:{value}"));
                    }
                    format!("{name}({})", args.join(","))
                }),
            (inner.clone(), comparison_source_strategy())
                .prop_map(|(list, cond)| format!("select({list})[{cond}]")),
        ]
    })
}

/// Strategy for coordinates with finite components.
pub fn coord_strategy() -> impl Strategy<Value = Coord> {
    (-1e6f64..1e6, -1e6f64..1e6).prop_map(|(x, y)| Coord::new(x, y))
}

fn ring_strategy() -> impl Strategy<Value = Vec<Coord>> {
    prop::collection::vec(coord_strategy(), 3..8).prop_map(|mut ring| {
        ring.push(ring[0]);
        ring
    })
}

/// Strategy for geometries of every kind.
pub fn geometry_strategy() -> impl Strategy<Value = Geometry> {
    prop_oneof![
        coord_strategy().prop_map(Geometry::Point),
        prop::collection::vec(coord_strategy(), 2..8).prop_map(Geometry::LineString),
        prop::collection::vec(ring_strategy(), 1..3).prop_map(Geometry::Polygon),
        prop::collection::vec(coord_strategy(), 1..5).prop_map(Geometry::MultiPoint),
        prop::collection::vec(prop::collection::vec(coord_strategy(), 2..5), 1..3)
            .prop_map(Geometry::MultiLineString),
        prop::collection::vec(prop::collection::vec(ring_strategy(), 1..2), 1..3)
            .prop_map(Geometry::MultiPolygon),
    ]
}

/// Strategy for WKT points with integer coordinates and an optional SRID.
pub fn point_wkt_strategy() -> impl Strategy<Value = String> {
    (
        prop::option::of(prop::sample::select(vec![4326u32, 3346])),
        -180i32..180,
        -90i32..90,
    )
        .prop_map(|(srid, x, y)| match srid {
            Some(srid) => format!("SRID={srid};POINT ({x} {y})"),
            None => format!("POINT ({x} {y})"),
        })
}

/// Strategy for a set of candidate values and a row value to look up in it.
pub fn value_set_strategy() -> impl Strategy<Value = (Vec<i64>, i64)> {
    (prop::collection::vec(0i64..20, 1..6), 0i64..20)
}

/// Strategy for report payloads with a status and a count.
pub fn report_payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::sample::select(vec!["ok", "warning", "failed"]),
        0i64..1000,
    )
        .prop_map(|(status, count)| json!({"status": status, "count": count}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagate_expr::parse;

    proptest! {
        #[test]
        fn generated_sources_parse(source in expr_source_strategy()) {
            prop_assert!(parse(&source).is_ok(), "{}", source);
        }

        #[test]
        fn generated_points_parse(wkt in point_wkt_strategy()) {
            prop_assert!(Geometry::parse(&wkt).is_ok(), "{}", wkt);
        }

        #[test]
        fn identifiers_are_not_keywords(name in ident_strategy()) {
            prop_assert!(!matches!(name.as_str(), "null" | "true" | "false"));
        }
    }
}
