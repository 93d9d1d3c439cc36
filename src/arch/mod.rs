// SPDX-License-Identifier: Apache-2.0

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
