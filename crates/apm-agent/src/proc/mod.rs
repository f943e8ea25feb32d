// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod hostname;

/// Id of the calling process. Changes in the child after a `fork`.
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}
