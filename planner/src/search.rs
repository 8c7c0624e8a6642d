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

//! the channel search engine and NIC-device resolution

use crate::graph::SearchGraph;
use crate::specs::{LinkKind, Topology};

mod ledger;
mod nets;
mod order;
mod recurse;

pub use recurse::count_direct_nvl;
pub(crate) use nets::select_nets;
pub(crate) use recurse::{
    search_rec, SEARCH_GLOBAL_TIMEOUT, SEARCH_TIMEOUT, SEARCH_TIMEOUT_SAMECHANNELS,
    SEARCH_TIMEOUT_TREE,
};

/// The NIC a rank should use on a channel of the final plan: the entry NIC
/// when the rank leads the channel, the exit NIC otherwise.
pub fn net_dev_for_rank(graph: &SearchGraph, rank: i32, channel_id: usize) -> i64 {
    assert!(graph.n_channels > 0);
    let channel = channel_id % graph.n_channels;
    let index = if graph.intra[channel * graph.intra_stride] == rank {
        0
    } else {
        1
    };
    graph.inter[channel * 2 + index]
}

/// The laterally annotated NIC for a rank, when the plan carries per-GPU
/// NIC annotations. `dir` is 0 for ingress, 1 for egress.
pub fn intra_net_dev_for_rank(
    topo: &Topology,
    graph: &SearchGraph,
    rank: i32,
    channel_id: usize,
    dir: usize,
) -> Option<i64> {
    if graph.n_intra_channels == 0 {
        return None;
    }
    let channel = channel_id % graph.n_intra_channels;
    let ngpus = topo.ngpus();
    for i in 0..ngpus {
        if graph.intra[channel * graph.intra_stride + i] == rank {
            let dev = graph.intra_nets[(channel * ngpus + i) * 2 + dir];
            if dev >= 0 && (dev as usize) < topo.nnets() {
                return Some(dev);
            }
            return None;
        }
    }
    None
}

/// The closest NIC to a GPU. `pxn_level` 0 refuses NICs that are only
/// reachable laterally through a peer GPU; higher levels accept them.
pub fn local_net_for_gpu(topo: &Topology, g: usize, pxn_level: i32) -> Option<i64> {
    for n in select_nets(topo, LinkKind::Sys, Some(g)) {
        let kind = topo
            .path_between(topo.gpu_index(g), topo.nic_index(n))?
            .kind;
        if pxn_level == 0 && kind == LinkKind::Pxn {
            continue;
        }
        return Some(topo.nic(n).id);
    }
    None
}

#[cfg(test)]
mod search_tests {
    use super::*;
    use crate::graph::{Pattern, SearchGraph};
    use crate::specs::{NicInfo, Topology};

    fn build_two_nic_host() -> Topology {
        let mut topo = Topology::new(4);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        let s0 = topo.add_pci_switch();
        let n0 = topo.add_nic(NicInfo {
            id: 0,
            asic: 0,
            port: 0,
            bw: 25.0,
            latency: 0.0,
            max_channels: 4,
            coll_support: false,
            gdr: true,
        });
        let n1 = topo.add_nic(NicInfo {
            id: 1,
            asic: 1,
            port: 0,
            bw: 25.0,
            latency: 0.0,
            max_channels: 4,
            coll_support: false,
            gdr: true,
        });
        topo.link_duplex(g0, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(g1, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(n0, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(n1, s0, LinkKind::Pix, 24.0);
        topo.finish();
        topo
    }

    #[test]
    fn test_net_dev_follows_channel_position() {
        let topo = build_two_nic_host();
        let mut graph = SearchGraph::new(0, Pattern::Ring);
        graph.prepare(&topo);
        graph.n_channels = 1;
        graph.intra[0] = 0;
        graph.intra[1] = 1;
        graph.inter[0] = 0;
        graph.inter[1] = 1;
        // The channel-leading rank enters through the entry NIC, everyone
        // else leaves through the exit NIC.
        assert_eq!(net_dev_for_rank(&graph, 0, 0), 0);
        assert_eq!(net_dev_for_rank(&graph, 1, 0), 1);
    }

    #[test]
    fn test_intra_net_dev_reads_annotations() {
        let topo = build_two_nic_host();
        let mut graph = SearchGraph::new(0, Pattern::Ring);
        graph.prepare(&topo);
        graph.n_channels = 1;
        graph.intra[0] = 0;
        graph.intra[1] = 1;
        assert_eq!(intra_net_dev_for_rank(&topo, &graph, 0, 0, 0), None);
        graph.n_intra_channels = 1;
        graph.intra_nets[0] = 1;
        assert_eq!(intra_net_dev_for_rank(&topo, &graph, 0, 0, 0), Some(1));
        assert_eq!(intra_net_dev_for_rank(&topo, &graph, 0, 0, 1), None);
    }

    #[test]
    fn test_local_net_rotates_by_device() {
        let topo = build_two_nic_host();
        assert_eq!(local_net_for_gpu(&topo, 0, 2), Some(0));
        assert_eq!(local_net_for_gpu(&topo, 1, 2), Some(1));
    }
}
