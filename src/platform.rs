// Copyright 2025 The Trek Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Platform callback surface
//!
//! The VM core is platform-agnostic; the platform layer supplies the few
//! services it cannot provide itself. Randomness arrives through
//! [`EntropySource`], which the address-space manager uses to randomize
//! placement when ASLR is enabled.

/// Provider of platform randomness.
///
/// Implementations fill the buffer with bytes from the platform RNG. The
/// quality requirement is set by the caller; placement randomization wants
/// unpredictability, not cryptographic strength.
pub trait EntropySource: Sync {
    /// Fill `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);
}
