//! Fuzz test for the REST normalizer with embedded records
//!
//! Arbitrary JSON hashes go through `RestSerializer` configured to embed
//! villains and minions. Sideload merging, root-key lookup and embedded
//! extraction must never panic.
//!
//! Run with: cargo +nightly fuzz run rest_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use quarry_core::{NormalizeContext, RequestType, ResourceType, Serializer};
use quarry_normalize::{EmbedOption, EmbeddedRecords, RestSerializer};
use quarry_test_utils::fixtures;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let registry = fixtures::villain_registry();
    let serializer = RestSerializer::new().with_embedded(
        EmbeddedRecords::new()
            .embed("home-planet", "villains", EmbedOption::always())
            .embed("super-villain", "evilMinions", EmbedOption::always()),
    );
    let ctx = NormalizeContext::new(&registry);

    for (primary, request) in [
        ("home-planet", RequestType::FindRecord),
        ("super-villain", RequestType::FindMany),
        ("comment", RequestType::FindAll),
    ] {
        if let Ok(document) = serializer.normalize_response(
            &ctx,
            &ResourceType::new(primary),
            payload.clone(),
            None,
            request,
        ) {
            // A resource with an id never appears twice in included.
            let mut seen = std::collections::HashSet::new();
            for resource in &document.included {
                if let Some(id) = &resource.id {
                    assert!(
                        seen.insert((resource.resource_type.clone(), id.clone())),
                        "duplicate resource in included"
                    );
                }
            }
        }
    }
});
