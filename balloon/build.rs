// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

fn main() {
    // Extra cfgs
    println!("cargo::rustc-check-cfg=cfg(fuzzing)");
}
