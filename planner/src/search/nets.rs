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

//! candidate NIC ordering for channel entry and return

use crate::specs::{LinkKind, Topology};
use itertools::Itertools;

/// Build the ordered list of NICs to try, closest proximity level first.
///
/// `gpu = None` builds a list suitable for any GPU (start of search);
/// `Some(g)` restricts to NICs as seen from that GPU (getting back to the
/// NIC). Within one (level, GPU) group the list is rotated by the GPU's
/// device number so that GPUs sharing a PCIe switch with several NICs do
/// not all pick the same one first. The final list keeps the first
/// occurrence of each NIC; it is empty when no NIC is within `type_inter`
/// reach.
pub(crate) fn select_nets(topo: &Topology, type_inter: LinkKind, gpu: Option<usize>) -> Vec<usize> {
    let mut nets = vec![];
    for level in LinkKind::through(type_inter) {
        for g in 0..topo.ngpus() {
            if gpu.is_some() && gpu != Some(g) {
                continue;
            }
            let mut local: Vec<usize> = (0..topo.nnets())
                .filter(|n| {
                    topo.path_between(topo.gpu_index(g), topo.nic_index(*n))
                        .map(|path| path.kind == level)
                        .unwrap_or(false)
                })
                .collect();
            if local.is_empty() {
                continue;
            }
            let rotation = topo.gpu(g).dev as usize % local.len();
            local.rotate_left(rotation);
            nets.extend(local);
        }
    }
    nets.into_iter().unique().collect()
}
