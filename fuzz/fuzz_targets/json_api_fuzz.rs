//! Fuzz test for the JSON:API normalizer
//!
//! Feeds arbitrary JSON documents through `JsonApiSerializer` for every
//! request type. Normalization must return `Ok` or `Err`, never panic, and a
//! successful document must only carry registered types.
//!
//! Run with: cargo +nightly fuzz run json_api_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use quarry_core::{NormalizeContext, RequestType, ResourceType, Serializer};
use quarry_normalize::JsonApiSerializer;
use quarry_test_utils::fixtures;

const REQUESTS: [RequestType; 3] = [
    RequestType::FindRecord,
    RequestType::FindMany,
    RequestType::UpdateRecord,
];

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let registry = fixtures::app_registry();
    let serializer = JsonApiSerializer::new();

    for request in REQUESTS {
        for drop_unknown in [false, true] {
            let ctx = NormalizeContext::new(&registry).with_drop_unknown_types(drop_unknown);
            let result = serializer.normalize_response(
                &ctx,
                &ResourceType::new("user"),
                payload.clone(),
                Some("1"),
                request,
            );
            if let Ok(document) = result {
                for resource in document.resources() {
                    assert!(
                        registry.schema(&resource.resource_type).is_ok(),
                        "normalized document carries an unregistered type"
                    );
                }
            }
        }
    }
});
