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

//! bandwidth reservation along precomputed paths
//!
//! Reservations mutate link bandwidth in place; every commit is paired with
//! a release (the same walk with negated bandwidth), so the ledger is
//! restored on every backtrack. All arithmetic snaps to a 1/1000 grid so a
//! commit/release pair is bit-identical despite float drift.

use crate::error::Error;
use crate::graph::SearchGraph;
use crate::specs::{CpuArch, CpuVendor, LinkKind, NodeClass, Topology};
use log::warn;
use petgraph::prelude::*;

/// Compute capability below which inbound host-driven traffic taxes the
/// reverse direction of the link.
const COMP_CAP_REVERSE_TAX: i32 = 80;

fn sub_round(a: f32, b: f32) -> f32 {
    ((a - b) * 1000.0).round() / 1000.0
}

/// P2P traffic through an Intel root complex consumes extra PCIe bandwidth.
fn intel_p2p_overhead(bw: f32) -> f32 {
    bw * 6.0 / 5.0
}

/// Walk up to `max_steps` hops of the precomputed `src -> dst` path,
/// debiting `bw` from each forward link (negate `bw` to credit). Returns
/// the number of hops actually walked; a short count means some link lacked
/// headroom and the caller must release the partial walk.
pub(crate) fn reserve(
    topo: &mut Topology,
    src: NodeIndex,
    dst: NodeIndex,
    max_steps: usize,
    bw: f32,
) -> Result<usize, Error> {
    let path = &topo.paths[&(src, dst)];
    let start_is_gpu = topo.graph[src].is_gpu();

    let mut pci_bw = bw;
    if path.kind == LinkKind::Phb && start_is_gpu {
        for edge in &path.hops {
            let (_, rem) = topo.graph.edge_endpoints(*edge).expect("edge in graph");
            if let NodeClass::Cpu(cpu) = &topo.graph[rem].class {
                if cpu.arch == CpuArch::X86 && cpu.vendor == CpuVendor::Intel {
                    pci_bw = intel_p2p_overhead(bw);
                }
            }
        }
    }

    let mut node = src;
    for step in 0..max_steps {
        let edge = path.hops[step];
        let (_, rem) = topo.graph.edge_endpoints(edge).expect("edge in graph");
        let link_kind = topo.graph[edge].kind;
        let fw_bw = if link_kind.is_pci() { pci_bw } else { bw };
        let mut rev_bw = 0.0;
        match &topo.graph[rem].class {
            NodeClass::Gpu(gpu) if gpu.comp_cap < COMP_CAP_REVERSE_TAX && !start_is_gpu => {
                rev_bw += fw_bw / 8.0;
            }
            NodeClass::Cpu(_) if link_kind == LinkKind::Nvl => rev_bw += fw_bw,
            _ => {}
        }
        let rev_link = if rev_bw != 0.0 {
            match topo.graph.find_edge(rem, node) {
                Some(rev) => Some(rev),
                None => {
                    warn!(
                        "could not find rev link for {} -> {}",
                        topo.graph[node].name, topo.graph[rem].name
                    );
                    return Err(Error::NoReverseLink(node, rem));
                }
            }
        } else {
            None
        };
        if topo.graph[edge].bw < fw_bw
            || rev_link.map_or(false, |rev| topo.graph[rev].bw < rev_bw)
        {
            return Ok(step);
        }
        let debited = sub_round(topo.graph[edge].bw, fw_bw);
        topo.graph[edge].bw = debited;
        if let Some(rev) = rev_link {
            let debited = sub_round(topo.graph[rev].bw, rev_bw);
            topo.graph[rev].bw = debited;
        }
        node = rem;
    }
    Ok(max_steps)
}

/// Try to traverse from `from` to `to`, reserving (`mult` = 1) or releasing
/// (`mult` = -1) the graph's current bandwidth step along the path.
///
/// `from = None` is the top-level start and always succeeds with no
/// reservation. Returns the destination on success, `None` when the path is
/// too remote for the graph's type threshold or lacks bandwidth; a failed
/// reservation is fully unwound before returning.
pub(crate) fn follow_path(
    topo: &mut Topology,
    graph: &mut SearchGraph,
    from: Option<NodeIndex>,
    to: NodeIndex,
    mult: i32,
) -> Result<Option<NodeIndex>, Error> {
    let from = match from {
        None => return Ok(Some(to)),
        Some(from) => from,
    };
    if from == to {
        return Ok(Some(to));
    }
    let (count, kind) = match topo.paths.get(&(from, to)) {
        Some(path) => (path.count(), path.kind),
        // Unlike a same-node hop, a missing path means the pair is
        // unreachable and the edge cannot be taken.
        None => return Ok(None),
    };

    let intra = topo.graph[from].is_gpu() && topo.graph[to].is_gpu();
    let mut bw = if intra { graph.bw_intra } else { graph.bw_inter };
    let threshold = if intra {
        graph.type_intra
    } else {
        graph.type_inter
    };
    if mult == 1 && kind > threshold {
        return Ok(None);
    }
    bw *= mult as f32;

    let step = reserve(topo, from, to, count, bw)?;
    if step < count {
        reserve(topo, from, to, step, -bw)?;
        return Ok(None);
    }
    graph.n_hops += mult as i64 * count as i64;
    Ok(Some(to))
}

#[cfg(test)]
mod ledger_tests {
    use super::*;
    use crate::graph::{Pattern, SearchGraph};
    use crate::specs::{NicInfo, Topology};

    fn snapshot(topo: &Topology) -> Vec<f32> {
        topo.graph
            .edge_references()
            .map(|edge| edge.weight().bw)
            .collect()
    }

    fn build_graph(topo: &Topology, bw_intra: f32, bw_inter: f32) -> SearchGraph {
        let mut graph = SearchGraph::new(0, Pattern::Ring);
        graph.prepare(topo);
        graph.bw_intra = bw_intra;
        graph.bw_inter = bw_inter;
        graph.type_intra = LinkKind::Sys;
        graph.type_inter = LinkKind::Sys;
        graph
    }

    fn build_nvl_pair(bw: f32) -> Topology {
        let mut topo = Topology::new(2);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        topo.link_duplex(g0, g1, LinkKind::Nvl, bw);
        topo.finish();
        topo
    }

    #[test]
    fn test_reserve_release_is_exact() {
        let mut topo = build_nvl_pair(50.0);
        let mut graph = build_graph(&topo, 3.3, 3.3);
        let before = snapshot(&topo);
        let (g0, g1) = (topo.gpu_index(0), topo.gpu_index(1));
        for _ in 0..100 {
            let node = follow_path(&mut topo, &mut graph, Some(g0), g1, 1).unwrap();
            assert!(node.is_some());
            follow_path(&mut topo, &mut graph, Some(g0), g1, -1).unwrap();
        }
        assert_eq!(snapshot(&topo), before);
        assert_eq!(graph.n_hops, 0);
    }

    #[test]
    fn test_reserve_stops_at_first_short_link() {
        let mut topo = Topology::new(3);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        let g2 = topo.add_gpu(2, &[2], 80);
        topo.link(g0, g1, LinkKind::Nvl, 50.0);
        topo.link(g1, g0, LinkKind::Nvl, 50.0);
        topo.link(g1, g2, LinkKind::Nvl, 5.0);
        topo.link(g2, g1, LinkKind::Nvl, 5.0);
        topo.finish();
        let before = snapshot(&topo);
        let mut graph = build_graph(&topo, 10.0, 10.0);
        // g0 -> g2 bottlenecks at 5.0 on the second hop; the partial
        // reservation must be unwound.
        let node = follow_path(&mut topo, &mut graph, Some(g0), g2, 1).unwrap();
        assert!(node.is_none());
        assert_eq!(snapshot(&topo), before);
        assert_eq!(graph.n_hops, 0);
    }

    #[test]
    fn test_type_threshold_gates_reservation() {
        let mut topo = build_nvl_pair(50.0);
        let mut graph = build_graph(&topo, 10.0, 10.0);
        graph.type_intra = LinkKind::Loc;
        let (g0, g1) = (topo.gpu_index(0), topo.gpu_index(1));
        let before = snapshot(&topo);
        let node = follow_path(&mut topo, &mut graph, Some(g0), g1, 1).unwrap();
        assert!(node.is_none());
        assert_eq!(snapshot(&topo), before);
    }

    #[test]
    fn test_start_and_same_node_are_free() {
        let mut topo = build_nvl_pair(50.0);
        let mut graph = build_graph(&topo, 10.0, 10.0);
        let g0 = topo.gpu_index(0);
        let before = snapshot(&topo);
        assert_eq!(
            follow_path(&mut topo, &mut graph, None, g0, 1).unwrap(),
            Some(g0)
        );
        assert_eq!(
            follow_path(&mut topo, &mut graph, Some(g0), g0, 1).unwrap(),
            Some(g0)
        );
        assert_eq!(snapshot(&topo), before);
        assert_eq!(graph.n_hops, 0);
    }

    #[test]
    fn test_intel_p2p_overhead_on_host_bridge_paths() {
        let mut topo = Topology::new(2);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        let cpu = topo.add_cpu(CpuArch::X86, CpuVendor::Intel);
        let e0 = topo.link(g0, cpu, LinkKind::Pix, 24.0);
        topo.link(cpu, g0, LinkKind::Pix, 24.0);
        let e1 = topo.link(cpu, g1, LinkKind::Pix, 24.0);
        topo.link(g1, cpu, LinkKind::Pix, 24.0);
        topo.finish();
        assert_eq!(topo.path_between(g0, g1).unwrap().kind, LinkKind::Phb);

        let mut graph = build_graph(&topo, 10.0, 10.0);
        let node = follow_path(&mut topo, &mut graph, Some(g0), g1, 1).unwrap();
        assert!(node.is_some());
        // PCIe hops are charged 6/5 of the nominal step.
        assert_eq!(topo.graph[e0].bw, 12.0);
        assert_eq!(topo.graph[e1].bw, 12.0);
        follow_path(&mut topo, &mut graph, Some(g0), g1, -1).unwrap();
        assert_eq!(topo.graph[e0].bw, 24.0);
        assert_eq!(topo.graph[e1].bw, 24.0);
    }

    #[test]
    fn test_reverse_tax_for_old_gpus_entered_from_nic() {
        let mut topo = Topology::new(4);
        let g0 = topo.add_gpu(0, &[0], 70);
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
        let nic_to_switch = topo.link(n0, s0, LinkKind::Pix, 24.0);
        topo.link(s0, n0, LinkKind::Pix, 24.0);
        let switch_to_gpu = topo.link(s0, g0, LinkKind::Pix, 24.0);
        let gpu_to_switch = topo.link(g0, s0, LinkKind::Pix, 24.0);
        topo.finish();

        let mut graph = build_graph(&topo, 8.0, 8.0);
        let node = follow_path(&mut topo, &mut graph, Some(n0), g0, 1).unwrap();
        assert!(node.is_some());
        assert_eq!(topo.graph[nic_to_switch].bw, 16.0);
        assert_eq!(topo.graph[switch_to_gpu].bw, 16.0);
        // One eighth of the forward charge lands on the reverse link.
        assert_eq!(topo.graph[gpu_to_switch].bw, 23.0);
        follow_path(&mut topo, &mut graph, Some(n0), g0, -1).unwrap();
        assert_eq!(topo.graph[gpu_to_switch].bw, 24.0);
    }

    #[test]
    fn test_nvlink_into_cpu_charges_reverse() {
        let mut topo = Topology::new(2);
        let g0 = topo.add_gpu(0, &[0], 80);
        let g1 = topo.add_gpu(1, &[1], 80);
        let cpu = topo.add_cpu(CpuArch::Power, CpuVendor::Other);
        let fwd = topo.link(g0, cpu, LinkKind::Nvl, 40.0);
        let rev = topo.link(cpu, g0, LinkKind::Nvl, 40.0);
        topo.link(cpu, g1, LinkKind::Nvl, 40.0);
        topo.link(g1, cpu, LinkKind::Nvl, 40.0);
        topo.finish();

        let mut graph = build_graph(&topo, 10.0, 10.0);
        let node = follow_path(&mut topo, &mut graph, Some(g0), g1, 1).unwrap();
        assert!(node.is_some());
        assert_eq!(topo.graph[fwd].bw, 30.0);
        // The NVLink into the CPU is charged in both directions.
        assert_eq!(topo.graph[rev].bw, 30.0);
        follow_path(&mut topo, &mut graph, Some(g0), g1, -1).unwrap();
        assert_eq!(topo.graph[fwd].bw, 40.0);
        assert_eq!(topo.graph[rev].bw, 40.0);
    }

    #[test]
    fn test_hop_accounting() {
        let mut topo = build_nvl_pair(50.0);
        let mut graph = build_graph(&topo, 10.0, 10.0);
        let (g0, g1) = (topo.gpu_index(0), topo.gpu_index(1));
        follow_path(&mut topo, &mut graph, Some(g0), g1, 1).unwrap();
        assert_eq!(graph.n_hops, 1);
        follow_path(&mut topo, &mut graph, Some(g1), g0, 1).unwrap();
        assert_eq!(graph.n_hops, 2);
        follow_path(&mut topo, &mut graph, Some(g1), g0, -1).unwrap();
        follow_path(&mut topo, &mut graph, Some(g0), g1, -1).unwrap();
        assert_eq!(graph.n_hops, 0);
    }
}
