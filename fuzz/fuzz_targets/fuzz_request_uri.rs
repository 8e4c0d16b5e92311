// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use libfuzzer_sys::fuzz_target;
use hdds_coap::message::{parse_request_uri, query_param, split_query};

fuzz_target!(|data: &[u8]| {
    let Ok(uri) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok((_endpoint, path)) = parse_request_uri(uri) {
        let (_, query) = split_query(&path);
        if let Some(q) = query {
            let _ = query_param(q, "rt");
            let _ = query_param(q, "if");
        }
    }
});
