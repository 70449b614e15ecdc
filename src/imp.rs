// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Backend implementations shipped with the crate.

mod software;

pub use software::{SoftwareOptions, SoftwareProcs};
