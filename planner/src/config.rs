// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! read-once environment configuration
//!
//! The planner never reads the environment on its own; callers capture it
//! once at entry with `Config::from_env` (or build a `Config` directly in
//! tests) and pass it down.

use log::info;
use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    /// Import a plan from this file and skip the search if it applies
    /// (`NCCL_GRAPH_FILE`).
    pub graph_file: Option<PathBuf>,
    /// Export the final plans here (`NCCL_GRAPH_DUMP_FILE`).
    pub graph_dump_file: Option<PathBuf>,
    /// User-supplied textual ring list; bypasses the search
    /// (`NCCL_RINGS`).
    pub ring_spec: Option<String>,
    /// 0 = forbid, 1 = allow, 2 = auto (`NCCL_CROSS_NIC`).
    pub cross_nic: i32,
    /// How aggressively to prefer lateral NIC egress, 0..=2
    /// (`NCCL_P2P_PXN_LEVEL`).
    pub pxn_level: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            graph_file: None,
            graph_dump_file: None,
            ring_spec: None,
            cross_nic: 2,
            pxn_level: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(path) = env::var("NCCL_GRAPH_FILE") {
            info!("NCCL_GRAPH_FILE set by environment to {}", path);
            config.graph_file = Some(PathBuf::from(path));
        }
        if let Ok(path) = env::var("NCCL_GRAPH_DUMP_FILE") {
            info!("NCCL_GRAPH_DUMP_FILE set by environment to {}", path);
            config.graph_dump_file = Some(PathBuf::from(path));
        }
        if let Ok(rings) = env::var("NCCL_RINGS") {
            if !rings.is_empty() {
                config.ring_spec = Some(rings);
            }
        }
        if let Ok(value) = env::var("NCCL_CROSS_NIC") {
            config.cross_nic = value.parse().unwrap_or(config.cross_nic);
        }
        if let Ok(value) = env::var("NCCL_P2P_PXN_LEVEL") {
            config.pxn_level = value.parse().unwrap_or(config.pxn_level);
        }
        config
    }
}
