// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel-wide type and error definitions

pub mod errors;
pub mod types;

pub use errors::{Error, Result};
pub use types::{PAddr, Status, VAddr};
