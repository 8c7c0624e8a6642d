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

//! the data model: topology nodes, links, paths and the system arena

mod link;
pub use link::Link;
pub use link::LinkKind;
pub use link::Path;
mod node;
pub use node::{CpuArch, CpuInfo, CpuVendor, GpuInfo, NicInfo, Node, NodeClass};
mod system;
pub use system::Topology;
pub use system::LOC_BW;
