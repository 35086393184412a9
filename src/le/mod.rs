// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Low Energy scanning and discovery.

pub mod discovery;
pub mod scanner;

pub use discovery::{
    LeDiscoveryConfig, LeDiscoveryFilter, LeDiscoveryManager, LeDiscoverySession,
};
pub use scanner::ScanType;
