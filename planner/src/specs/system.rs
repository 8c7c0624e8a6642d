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

//! the discovered system: nodes, links and precomputed paths
//!
//! Topology discovery itself happens elsewhere; this module holds the result
//! and offers a builder plus a path precomputation pass good enough for
//! hand-built systems and tests. The petgraph arena owns nodes and links;
//! everything else refers to them by `NodeIndex`/`EdgeIndex`.

use crate::error::Error;
use crate::specs::link::{Link, LinkKind, Path};
use crate::specs::node::{CpuArch, CpuInfo, CpuVendor, GpuInfo, NicInfo, Node, NodeClass};
use log::warn;
use petgraph::prelude::*;
use std::collections::HashMap;
use std::collections::VecDeque;

/// Nominal bandwidth of a device to itself, used to seed the search when
/// the system is a single GPU with no NICs.
pub const LOC_BW: f32 = 5000.0;

#[derive(Clone, Debug)]
pub struct Topology {
    pub(crate) graph: DiGraph<Node, Link>,
    pub(crate) gpus: Vec<NodeIndex>,
    pub(crate) cpus: Vec<NodeIndex>,
    pub(crate) nics: Vec<NodeIndex>,
    pub(crate) switches: Vec<NodeIndex>,
    pub(crate) paths: HashMap<(NodeIndex, NodeIndex), Path>,
    /// Total ranks in the job. When NICs exist and this exceeds the local
    /// GPU count, channels enter and leave through the network.
    pub(crate) n_ranks: usize,
    /// Best per-channel bandwidth any GPU can reach (to a NIC when NICs
    /// exist, to a peer GPU otherwise). Seeds the speed sweep.
    pub(crate) max_bw: f32,
    /// Best aggregate bandwidth out of any single GPU.
    pub(crate) total_bw: f32,
}

impl Topology {
    pub fn new(n_ranks: usize) -> Self {
        Self {
            graph: DiGraph::new(),
            gpus: vec![],
            cpus: vec![],
            nics: vec![],
            switches: vec![],
            paths: HashMap::new(),
            n_ranks,
            max_bw: 0.0,
            total_bw: 0.0,
        }
    }

    pub fn add_gpu(&mut self, dev: i32, ranks: &[i32], comp_cap: i32) -> NodeIndex {
        let id = self.graph.add_node(Node {
            name: format!("gpu_{}", dev),
            class: NodeClass::Gpu(GpuInfo {
                dev,
                ranks: ranks.to_vec(),
                comp_cap,
                used: 0,
            }),
        });
        self.gpus.push(id);
        id
    }

    pub fn add_cpu(&mut self, arch: CpuArch, vendor: CpuVendor) -> NodeIndex {
        let id = self.graph.add_node(Node {
            name: format!("cpu_{}", self.cpus.len()),
            class: NodeClass::Cpu(CpuInfo { arch, vendor }),
        });
        self.cpus.push(id);
        id
    }

    pub fn add_nic(&mut self, nic: NicInfo) -> NodeIndex {
        let id = self.graph.add_node(Node {
            name: format!("nic_{}", nic.id),
            class: NodeClass::Nic(nic),
        });
        self.nics.push(id);
        id
    }

    pub fn add_pci_switch(&mut self) -> NodeIndex {
        let id = self.graph.add_node(Node {
            name: format!("pci_{}", self.switches.len()),
            class: NodeClass::PciSwitch,
        });
        self.switches.push(id);
        id
    }

    /// Add one directed link.
    pub fn link(&mut self, src: NodeIndex, dst: NodeIndex, kind: LinkKind, bw: f32) -> EdgeIndex {
        self.graph.add_edge(src, dst, Link::new(kind, bw))
    }

    /// Add a pair of opposite links with the same kind and bandwidth.
    pub fn link_duplex(&mut self, a: NodeIndex, b: NodeIndex, kind: LinkKind, bw: f32) {
        self.link(a, b, kind, bw);
        self.link(b, a, kind, bw);
    }

    /// Precompute paths and seed the search bounds. Call once after the
    /// topology is fully described and before planning.
    pub fn finish(&mut self) {
        self.compute_paths();
        self.init_search_bounds();
    }

    pub fn ngpus(&self) -> usize {
        self.gpus.len()
    }

    pub fn nnets(&self) -> usize {
        self.nics.len()
    }

    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    pub fn max_bw(&self) -> f32 {
        self.max_bw
    }

    pub fn total_bw(&self) -> f32 {
        self.total_bw
    }

    /// Ranks hosted locally, across all GPUs.
    pub fn local_ranks(&self) -> usize {
        self.gpus
            .iter()
            .map(|id| self.gpu_at(*id).ranks.len())
            .sum()
    }

    pub fn node(&self, id: NodeIndex) -> &Node {
        &self.graph[id]
    }

    pub fn gpu_index(&self, g: usize) -> NodeIndex {
        self.gpus[g]
    }

    pub fn nic_index(&self, n: usize) -> NodeIndex {
        self.nics[n]
    }

    pub fn gpu(&self, g: usize) -> &GpuInfo {
        self.gpu_at(self.gpus[g])
    }

    pub fn nic(&self, n: usize) -> &NicInfo {
        self.graph[self.nics[n]].as_nic().expect("nic arena entry")
    }

    pub(crate) fn gpu_at(&self, id: NodeIndex) -> &GpuInfo {
        self.graph[id].as_gpu().expect("gpu arena entry")
    }

    pub(crate) fn gpu_mut(&mut self, g: usize) -> &mut GpuInfo {
        let id = self.gpus[g];
        match &mut self.graph[id].class {
            NodeClass::Gpu(gpu) => gpu,
            _ => unreachable!("gpu arena entry"),
        }
    }

    pub(crate) fn nic_mut(&mut self, n: usize) -> &mut NicInfo {
        let id = self.nics[n];
        match &mut self.graph[id].class {
            NodeClass::Nic(nic) => nic,
            _ => unreachable!("nic arena entry"),
        }
    }

    /// Arena position of a GPU node.
    pub(crate) fn gpu_pos(&self, id: NodeIndex) -> usize {
        self.gpus
            .iter()
            .position(|g| *g == id)
            .expect("node is a gpu")
    }

    pub fn path_between(&self, src: NodeIndex, dst: NodeIndex) -> Option<&Path> {
        self.paths.get(&(src, dst))
    }

    /// Resolve a rank to its GPU arena position.
    pub fn rank_to_gpu(&self, rank: i32) -> Result<usize, Error> {
        for (g, id) in self.gpus.iter().enumerate() {
            if self.gpu_at(*id).ranks.contains(&rank) {
                return Ok(g);
            }
        }
        warn!("could not find gpu rank {}", rank);
        Err(Error::InvalidRank(rank))
    }

    /// Resolve a NIC id to its arena position.
    pub fn net_to_index(&self, id: i64) -> Result<usize, Error> {
        for (n, nic_id) in self.nics.iter().enumerate() {
            if self.graph[*nic_id].as_nic().map(|nic| nic.id) == Some(id) {
                return Ok(n);
            }
        }
        warn!("could not find net id {:x}", id);
        Err(Error::InvalidNet(id))
    }

    /// Resolve a GPU device number to its arena position.
    pub fn dev_to_gpu(&self, dev: i32) -> Result<usize, Error> {
        for (g, id) in self.gpus.iter().enumerate() {
            if self.gpu_at(*id).dev == dev {
                return Ok(g);
            }
        }
        Err(Error::InvalidDevice(dev))
    }

    /// Bottleneck of the GPU's own PCIe attachment: the min of the duplex
    /// pair to its first PCIe neighbor, or -1.0 when the GPU has none.
    pub(crate) fn gpu_pci_bw(&self, g: usize) -> f32 {
        let gpu_id = self.gpus[g];
        for edge in self.graph.edges(gpu_id) {
            if !edge.weight().kind.is_pci() {
                continue;
            }
            let pci_id = edge.target();
            if let Some(rev) = self.graph.find_edge(pci_id, gpu_id) {
                return edge.weight().bw.min(self.graph[rev].bw);
            }
        }
        -1.0
    }

    /// Widest-then-shortest paths between every ordered (GPU|NIC) pair.
    ///
    /// Label-correcting relaxation: a candidate replaces the incumbent when
    /// its bottleneck bandwidth is larger, or equal with fewer hops. NICs
    /// are endpoints only and are never routed through.
    fn compute_paths(&mut self) {
        let endpoints: Vec<NodeIndex> = self.gpus.iter().chain(self.nics.iter()).copied().collect();
        for src in &endpoints {
            let reached = self.relax_from(*src);
            for dst in &endpoints {
                if dst == src {
                    continue;
                }
                if let Some(path) = Self::assemble_path(&self.graph, &reached, *src, *dst) {
                    self.paths.insert((*src, *dst), path);
                }
            }
        }
    }

    fn relax_from(&self, src: NodeIndex) -> HashMap<NodeIndex, (f32, usize, EdgeIndex)> {
        // node -> (bottleneck bw, hops, incoming edge on the best path)
        let mut best: HashMap<NodeIndex, (f32, usize, EdgeIndex)> = HashMap::new();
        let mut queue = VecDeque::from([src]);
        while let Some(u) = queue.pop_front() {
            if u != src && self.graph[u].is_nic() {
                continue;
            }
            let (u_bw, u_hops) = if u == src {
                (f32::INFINITY, 0)
            } else {
                let (bw, hops, _) = best[&u];
                (bw, hops)
            };
            for edge in self.graph.edges(u) {
                let v = edge.target();
                if v == src {
                    continue;
                }
                let bw = u_bw.min(edge.weight().bw);
                let hops = u_hops + 1;
                let better = match best.get(&v) {
                    None => true,
                    Some((v_bw, v_hops, _)) => bw > *v_bw || (bw == *v_bw && hops < *v_hops),
                };
                if better {
                    best.insert(v, (bw, hops, edge.id()));
                    queue.push_back(v);
                }
            }
        }
        best
    }

    fn assemble_path(
        graph: &DiGraph<Node, Link>,
        reached: &HashMap<NodeIndex, (f32, usize, EdgeIndex)>,
        src: NodeIndex,
        dst: NodeIndex,
    ) -> Option<Path> {
        let (bw, _, _) = reached.get(&dst)?;
        let mut hops = vec![];
        let mut at = dst;
        while at != src {
            let (_, _, edge) = reached[&at];
            hops.push(edge);
            at = graph.edge_endpoints(edge).expect("edge in graph").0;
        }
        hops.reverse();
        let kind = Self::derive_kind(graph, &hops);
        Some(Path {
            hops,
            kind,
            bw: *bw,
        })
    }

    /// The coarsest link kind along the path, upgraded for what the route
    /// passes through: a CPU makes it at least `Phb`, two or more PCIe
    /// switches at least `Pxb`, an NVLink route through a peer GPU `Nvb`.
    fn derive_kind(graph: &DiGraph<Node, Link>, hops: &[EdgeIndex]) -> LinkKind {
        let mut kind = LinkKind::Loc;
        for edge in hops {
            kind = kind.max(graph[*edge].kind);
        }
        let mut switches = 0;
        let mut through_cpu = false;
        let mut through_gpu = false;
        for edge in &hops[..hops.len().saturating_sub(1)] {
            let (_, mid) = graph.edge_endpoints(*edge).expect("edge in graph");
            match graph[mid].class {
                NodeClass::PciSwitch => switches += 1,
                NodeClass::Cpu(_) => through_cpu = true,
                NodeClass::Gpu(_) => through_gpu = true,
                NodeClass::Nic(_) => {}
            }
        }
        if through_gpu && kind == LinkKind::Nvl {
            kind = LinkKind::Nvb;
        }
        if switches >= 2 {
            kind = kind.max(LinkKind::Pxb);
        }
        if through_cpu {
            kind = kind.max(LinkKind::Phb);
        }
        kind
    }

    /// Seed `max_bw`/`total_bw` from the precomputed paths, mirroring the
    /// search's view of what one channel could possibly carry.
    fn init_search_bounds(&mut self) {
        self.max_bw = 0.0;
        self.total_bw = 0.0;
        let inter = !self.nics.is_empty();
        if !inter && self.gpus.len() == 1 {
            self.max_bw = LOC_BW;
            return;
        }
        let targets: &[NodeIndex] = if inter { &self.nics } else { &self.gpus };
        for gpu_id in &self.gpus {
            for target in targets {
                if let Some(path) = self.paths.get(&(*gpu_id, *target)) {
                    self.max_bw = self.max_bw.max(path.bw);
                }
            }
            let mut nvlink_bw = 0.0;
            let mut pci_bw = 0.0;
            for edge in self.graph.edges(*gpu_id) {
                let link = edge.weight();
                if link.kind == LinkKind::Nvl {
                    nvlink_bw += link.bw;
                }
                if link.kind.is_pci() {
                    pci_bw = link.bw;
                }
            }
            self.total_bw = self.total_bw.max(nvlink_bw.max(pci_bw));
        }
    }
}

#[cfg(test)]
mod system_tests {
    use super::*;

    /// gpu0, gpu1 under one switch; gpu2 under a second switch; the
    /// switches hang off one Intel CPU; one NIC per switch.
    fn build_pcie_host() -> Topology {
        let mut topo = Topology::new(8);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        let g2 = topo.add_gpu(2, &[2], 80);
        let cpu = topo.add_cpu(CpuArch::X86, CpuVendor::Intel);
        let s0 = topo.add_pci_switch();
        let s1 = topo.add_pci_switch();
        let n0 = topo.add_nic(NicInfo {
            id: 0,
            asic: 0,
            port: 0,
            bw: 25.0,
            latency: 1.0,
            max_channels: 4,
            coll_support: false,
            gdr: true,
        });
        let n1 = topo.add_nic(NicInfo {
            id: 1,
            asic: 1,
            port: 0,
            bw: 25.0,
            latency: 1.0,
            max_channels: 4,
            coll_support: false,
            gdr: true,
        });
        topo.link_duplex(g0, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(g1, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(g2, s1, LinkKind::Pix, 24.0);
        topo.link_duplex(s0, cpu, LinkKind::Pix, 24.0);
        topo.link_duplex(s1, cpu, LinkKind::Pix, 24.0);
        topo.link_duplex(n0, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(n1, s1, LinkKind::Pix, 24.0);
        topo.finish();
        topo
    }

    #[test]
    fn test_same_switch_path_is_pix() {
        let topo = build_pcie_host();
        let path = topo
            .path_between(topo.gpu_index(0), topo.gpu_index(1))
            .unwrap();
        assert_eq!(path.kind, LinkKind::Pix);
        assert_eq!(path.count(), 2);
        assert_eq!(path.bw, 24.0);
    }

    #[test]
    fn test_cross_cpu_path_is_phb() {
        let topo = build_pcie_host();
        let path = topo
            .path_between(topo.gpu_index(0), topo.gpu_index(2))
            .unwrap();
        assert_eq!(path.kind, LinkKind::Phb);
        assert_eq!(path.count(), 4);
    }

    #[test]
    fn test_nic_paths() {
        let topo = build_pcie_host();
        let near = topo
            .path_between(topo.gpu_index(0), topo.nic_index(0))
            .unwrap();
        assert_eq!(near.kind, LinkKind::Pix);
        let far = topo
            .path_between(topo.gpu_index(0), topo.nic_index(1))
            .unwrap();
        assert_eq!(far.kind, LinkKind::Phb);
    }

    #[test]
    fn test_paths_do_not_route_through_nics() {
        let mut topo = Topology::new(2);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        let n0 = topo.add_nic(NicInfo {
            id: 0,
            asic: 0,
            port: 0,
            bw: 100.0,
            latency: 0.0,
            max_channels: 4,
            coll_support: false,
            gdr: false,
        });
        // The only route between the GPUs crosses the NIC; no GPU-GPU path
        // may be recorded.
        topo.link_duplex(g0, n0, LinkKind::Pix, 100.0);
        topo.link_duplex(n0, g1, LinkKind::Pix, 100.0);
        topo.finish();
        assert!(topo.path_between(g0, g1).is_none());
        assert!(topo.path_between(g0, n0).is_some());
    }

    #[test]
    fn test_search_bounds_single_gpu() {
        let mut topo = Topology::new(1);
        topo.add_gpu(0, &[0], 80);
        topo.finish();
        assert_eq!(topo.max_bw(), LOC_BW);
        assert_eq!(topo.total_bw(), 0.0);
    }

    #[test]
    fn test_search_bounds_nvlink_pair() {
        let mut topo = Topology::new(2);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        topo.link_duplex(g0, g1, LinkKind::Nvl, 50.0);
        topo.finish();
        assert_eq!(topo.max_bw(), 50.0);
        assert_eq!(topo.total_bw(), 50.0);
    }

    #[test]
    fn test_search_bounds_with_nics() {
        let topo = build_pcie_host();
        // max_bw is measured against NICs when NICs exist.
        assert_eq!(topo.max_bw(), 24.0);
        assert_eq!(topo.total_bw(), 24.0);
    }

    #[test]
    fn test_gpu_pci_bw() {
        let topo = build_pcie_host();
        assert_eq!(topo.gpu_pci_bw(0), 24.0);
        let mut bare = Topology::new(2);
        let g0 = bare.add_gpu(0, &[0], 80);
        let g1 = bare.add_gpu(1, &[1], 80);
        bare.link_duplex(g0, g1, LinkKind::Nvl, 50.0);
        bare.finish();
        assert_eq!(bare.gpu_pci_bw(0), -1.0);
    }

    #[test]
    fn test_rank_and_net_lookups() {
        let topo = build_pcie_host();
        assert_eq!(topo.rank_to_gpu(2).unwrap(), 2);
        assert_eq!(topo.rank_to_gpu(7), Err(Error::InvalidRank(7)));
        assert_eq!(topo.net_to_index(1).unwrap(), 1);
        assert_eq!(topo.net_to_index(9), Err(Error::InvalidNet(9)));
        assert_eq!(topo.dev_to_gpu(1).unwrap(), 1);
        assert_eq!(topo.dev_to_gpu(9), Err(Error::InvalidDevice(9)));
    }
}
