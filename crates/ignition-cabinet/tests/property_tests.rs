//! Property-based tests for the cabinet container

use ignition_cabinet::{Archive, ArchiveBuilder, ParseLimits};
use proptest::prelude::*;

fn arb_entry() -> impl Strategy<Value = (String, Vec<u8>)> {
    (
        "[a-z][a-z0-9_.-]{0,20}",
        prop::collection::vec(any::<u8>(), 0..2048),
    )
}

fn arb_entries() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::vec(arb_entry(), 1..8).prop_filter("unique basenames", |entries| {
        let mut names: Vec<String> = entries.iter().map(|(n, _)| n.to_lowercase()).collect();
        names.sort();
        names.dedup();
        names.len() == entries.len()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// write(parse(b)) reproduces b for any archive we produced ourselves.
    #[test]
    fn prop_archive_write_roundtrip(entries in arb_entries()) {
        let mut builder = ArchiveBuilder::new();
        for (name, data) in &entries {
            builder = builder.add(name, data)
                .map_err(|e| TestCaseError::fail(format!("add failed: {e}")))?;
        }
        let bytes = builder.build().write();

        let parsed = Archive::parse(&bytes, &ParseLimits::default())
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        prop_assert_eq!(parsed.write(), bytes);

        for (name, data) in &entries {
            let blob = parsed.blob(name)
                .map_err(|e| TestCaseError::fail(format!("blob failed: {e}")))?;
            prop_assert_eq!(blob, data.as_slice());
        }
    }

    /// Deterministic output: building the same entries twice gives the
    /// same bytes.
    #[test]
    fn prop_archive_write_deterministic(entries in arb_entries()) {
        let build = |entries: &[(String, Vec<u8>)]| -> Result<Vec<u8>, TestCaseError> {
            let mut builder = ArchiveBuilder::new();
            for (name, data) in entries {
                builder = builder.add(name, data)
                    .map_err(|e| TestCaseError::fail(format!("add failed: {e}")))?;
            }
            Ok(builder.build().write())
        };
        prop_assert_eq!(build(&entries)?, build(&entries)?);
    }
}
