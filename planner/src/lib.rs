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

//! collective-communication topology planner
//!
//! Given a discovered hardware graph of GPUs, CPUs, PCIe switches and
//! NICs, the planner searches for a set of logical channels (rings or
//! trees) that maximizes usable aggregate bandwidth under link-capacity
//! and pattern constraints. The search reserves fractional link bandwidth
//! depth-first with full rollback, while an outer loop relaxes its
//! parameters until a solution is acceptable.

mod config;
mod error;
mod graph;
mod graphio;
mod optimize;
mod rings;
mod search;
pub mod specs;

// canned topologies for tests and demos
pub mod predefined;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::graph::{Pattern, SearchGraph, MAX_CHANNELS};
pub use crate::graphio::{
    apply_graphs, dump_graphs, load_graph, print_graph, render_graphs, GRAPH_FILE_VERSION,
};
pub use crate::optimize::compute;
pub use crate::rings::parse_ring_list;
pub use crate::search::{
    count_direct_nvl, intra_net_dev_for_rank, local_net_for_gpu, net_dev_for_rank,
};
pub use crate::specs::{
    CpuArch, CpuVendor, GpuInfo, Link, LinkKind, NicInfo, Node, NodeClass, Path, Topology, LOC_BW,
};
pub use petgraph::graph::{EdgeIndex, NodeIndex};
