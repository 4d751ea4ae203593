//! Property-based tests for version comparison

use std::cmp::Ordering;

use ignition_version::{Version, VersionFormat};
use proptest::prelude::*;

fn arb_quad() -> impl Strategy<Value = String> {
    (0u64..200, 0u64..200, 0u64..200, 0u64..200)
        .prop_map(|(a, b, c, d)| format!("{a}.{b}.{c}.{d}"))
}

fn arb_format() -> impl Strategy<Value = (VersionFormat, String)> {
    prop_oneof![
        arb_quad().prop_map(|v| (VersionFormat::Quad, v)),
        (0u64..100_000).prop_map(|v| (VersionFormat::Number, v.to_string())),
        (0u64..0xffff).prop_map(|v| (VersionFormat::Hex, format!("0x{v:x}"))),
        "[a-z0-9._-]{1,16}".prop_map(|v| (VersionFormat::Plain, v)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_compare_is_reflexive((format, raw) in arb_format()) {
        let v = Version::parse(&raw, format)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        prop_assert_eq!(v.compare(&v), Ordering::Equal);
    }

    #[test]
    fn prop_compare_is_antisymmetric(a in arb_quad(), b in arb_quad()) {
        let va = Version::parse(&a, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        let vb = Version::parse(&b, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        prop_assert_eq!(va.compare(&vb), vb.compare(&va).reverse());
    }

    #[test]
    fn prop_compare_is_transitive(a in arb_quad(), b in arb_quad(), c in arb_quad()) {
        let va = Version::parse(&a, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        let vb = Version::parse(&b, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        let vc = Version::parse(&c, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        if va.compare(&vb) != Ordering::Greater && vb.compare(&vc) != Ordering::Greater {
            prop_assert_ne!(va.compare(&vc), Ordering::Greater);
        }
    }

    #[test]
    fn prop_quad_compare_matches_component_order(a in arb_quad(), b in arb_quad()) {
        let va = Version::parse(&a, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        let vb = Version::parse(&b, VersionFormat::Quad)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        let expected = va.components().cmp(vb.components());
        prop_assert_eq!(va.compare(&vb), expected);
    }
}
