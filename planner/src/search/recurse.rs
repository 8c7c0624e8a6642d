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

//! the depth-first, bandwidth-reserving channel search
//!
//! One channel is built at a time by visiting GPUs in ranked order,
//! reserving bandwidth edge by edge and releasing it on every unwind. The
//! `time` counter decrements on every recursive entry; it reaching 0 cuts
//! the search short, and -1 signals that a perfect solution was found and
//! all outer iterations should stop.

use crate::error::Error;
use crate::graph::{Pattern, SearchGraph};
use crate::search::ledger::follow_path;
use crate::search::nets::select_nets;
use crate::search::order::next_gpu_order;
use crate::specs::{LinkKind, Topology};

pub(crate) const SEARCH_GLOBAL_TIMEOUT: i64 = 1 << 18;
pub(crate) const SEARCH_TIMEOUT: i64 = 1 << 14;
pub(crate) const SEARCH_TIMEOUT_TREE: i64 = 1 << 14;
pub(crate) const SEARCH_TIMEOUT_SAMECHANNELS: i64 = 1 << 8;
/// Budget of the PCI-order probe that seeds a reference solution.
const SEARCH_TIMEOUT_PROBE: i64 = 1 << 10;

/// How the next GPU of a channel is picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ForcedOrder {
    /// Ranked candidates from `next_gpu_order`.
    None,
    /// Sequential device order; used to cheaply seed a reference solution.
    Pci,
    /// The GPU at the same position in the previous channel.
    Replay,
}

/// GPU-direct: the NIC can reach the GPU's memory without bouncing through
/// the host, which takes at most a PCIe-bridge distance.
fn gdr_ok(topo: &Topology, g: usize, n: usize) -> bool {
    topo.nic(n).gdr
        && topo
            .path_between(topo.gpu_index(g), topo.nic_index(n))
            .map_or(false, |path| path.kind <= LinkKind::Pxb)
}

/// The GPU at position `pos` of the previously completed channel.
fn replay_gpu_at(topo: &Topology, graph: &SearchGraph, pos: usize) -> Result<usize, Error> {
    if graph.n_channels == 0 {
        return Err(Error::NoPreviousChannel);
    }
    let ngpus = topo.ngpus();
    let next_rank = graph.intra[(graph.n_channels - 1) * ngpus + pos];
    topo.rank_to_gpu(next_rank)
}

/// Direct NVLink edges between consecutive ranks, summed over all channels.
pub fn count_direct_nvl(topo: &Topology, graph: &SearchGraph) -> usize {
    let stride = graph.intra_stride;
    let mut count = 0;
    for c in 0..graph.n_channels {
        for i in 0..stride {
            let rank = graph.intra[c * stride + i];
            let next_rank = graph.intra[c * stride + (i + 1) % stride];
            let j = match topo.rank_to_gpu(rank) {
                Ok(j) => j,
                Err(_) => continue,
            };
            for k in 0..topo.ngpus() {
                let path = match topo.path_between(topo.gpu_index(j), topo.gpu_index(k)) {
                    Some(path) if path.count() == 1 => path,
                    _ => continue,
                };
                let link = path.hops[0];
                let (_, rem) = topo.graph.edge_endpoints(link).expect("edge in graph");
                if let Some(gpu) = topo.graph[rem].as_gpu() {
                    if gpu.ranks.contains(&next_rank) && topo.graph[link].kind == LinkKind::Nvl {
                        count += 1;
                    }
                }
            }
        }
    }
    count
}

/// Decide whether `graph` should replace `reference` as the best solution.
/// Greedy, not a total order.
pub(crate) fn compare_graphs(
    topo: &Topology,
    graph: &SearchGraph,
    reference: &SearchGraph,
) -> bool {
    // 1. Hold the channel count floor (keeps rings and trees comparable).
    if graph.n_channels < graph.min_channels {
        return false;
    }
    // 2. Better aggregate bandwidth wins.
    let aggregate = graph.n_channels as f32 * graph.bw_intra;
    let best = reference.n_channels as f32 * reference.bw_intra;
    if aggregate < best {
        return false;
    }
    if aggregate > best {
        return true;
    }
    // 3. Fewer hops, but not at the price of going cross-NIC.
    if graph.pattern == reference.pattern
        && graph.cross_nic == reference.cross_nic
        && graph.n_hops < reference.n_hops
    {
        return true;
    }
    // 4. Prefer more direct accelerator-interconnect edges.
    if graph.n_channels == reference.n_channels
        && count_direct_nvl(topo, reference) < count_direct_nvl(topo, graph)
    {
        return true;
    }
    false
}

/// Reserve the edge into GPU `g`, mark it used on this channel, recurse,
/// then unwind both.
#[allow(clippy::too_many_arguments)]
pub(crate) fn try_gpu(
    topo: &mut Topology,
    graph: &mut SearchGraph,
    save: &mut SearchGraph,
    step: i32,
    back_to_net: i32,
    back_to_first_rank: i32,
    forced: ForcedOrder,
    time: &mut i64,
    from: Option<petgraph::graph::NodeIndex>,
    g: usize,
) -> Result<(), Error> {
    let flag = 1u64 << graph.n_channels;
    let gpu_node = topo.gpu_index(g);
    let node = follow_path(topo, graph, from, gpu_node, 1)?;
    if node.is_some() {
        topo.gpu_mut(g).used ^= flag;
        rec_gpu(
            topo,
            graph,
            save,
            g,
            step,
            back_to_net,
            back_to_first_rank,
            forced,
            time,
        )?;
        topo.gpu_mut(g).used ^= flag;
        follow_path(topo, graph, from, gpu_node, -1)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn rec_gpu(
    topo: &mut Topology,
    graph: &mut SearchGraph,
    save: &mut SearchGraph,
    gpu: usize,
    step: i32,
    back_to_net: i32,
    back_to_first_rank: i32,
    forced: ForcedOrder,
    time: &mut i64,
) -> Result<(), Error> {
    if *time <= 0 {
        return Ok(());
    }
    *time -= 1;

    let ngpus = topo.ngpus();
    if step == ngpus as i32 {
        // Channel complete; keep it if it beats the best so far, then try
        // to grow the plan by one more channel.
        graph.n_channels += 1;
        if compare_graphs(topo, graph, save) {
            save.clone_from(graph);
            if graph.n_channels == graph.max_channels {
                *time = -1;
            }
        }
        if graph.n_channels < graph.max_channels {
            search_rec(topo, graph, save, time)?;
        }
        graph.n_channels -= 1;
        return Ok(());
    }

    graph.intra[graph.n_channels * ngpus + step as usize] = topo.gpu(gpu).ranks[0];
    let g = gpu;
    if step == back_to_net {
        if topo.nnets() > 0 {
            let start_net = topo.net_to_index(graph.inter[graph.n_channels * 2])?;
            let start_id = topo.nic(start_net).id;
            let start_asic = topo.nic(start_net).asic;
            let start_port = topo.nic(start_net).port;
            let gpu_node = topo.gpu_index(g);
            for n in select_nets(topo, graph.type_inter, Some(g)) {
                let net_id = topo.nic(n).id;
                // Trees are symmetric: they must come back in where they left.
                if graph.pattern == Pattern::Tree && net_id != start_id {
                    continue;
                }
                if graph.cross_nic != 1
                    && (topo.nic(n).asic != start_asic || topo.nic(n).port != start_port)
                {
                    continue;
                }

                // Balanced trees split the return over the first two GPUs,
                // each carrying half the bandwidth.
                let mut next_back_to_net = -1;
                let bw_inter_save = graph.bw_inter;
                if graph.pattern == Pattern::BalancedTree {
                    if step == 0 {
                        next_back_to_net = 1;
                    } else if net_id != graph.inter[graph.n_channels * 2 + 1] {
                        continue;
                    }
                    graph.bw_inter /= 2.0;
                }

                let nic_node = topo.nic_index(n);
                let net = follow_path(topo, graph, Some(gpu_node), nic_node, 1)?;
                graph.bw_inter = bw_inter_save;
                if net.is_some() {
                    graph.inter[graph.n_channels * 2 + 1] = net_id;
                    rec_gpu(
                        topo,
                        graph,
                        save,
                        gpu,
                        step,
                        next_back_to_net,
                        back_to_first_rank,
                        forced,
                        time,
                    )?;
                    if graph.pattern == Pattern::BalancedTree {
                        graph.bw_inter /= 2.0;
                    }
                    follow_path(topo, graph, Some(gpu_node), nic_node, -1)?;
                    graph.bw_inter = bw_inter_save;
                }
            }
        }
    } else if step < ngpus as i32 - 1 {
        let candidates = match forced {
            ForcedOrder::Pci => vec![step as usize + 1],
            ForcedOrder::Replay => vec![replay_gpu_at(topo, graph, step as usize + 1)?],
            ForcedOrder::None => {
                let sort_net = if back_to_net == -1 {
                    0
                } else if back_to_net == step + 1 {
                    1
                } else {
                    -1
                };
                next_gpu_order(topo, graph, g, sort_net)?
            }
        };
        let gpu_node = topo.gpu_index(g);
        for next in candidates {
            try_gpu(
                topo,
                graph,
                save,
                step + 1,
                back_to_net,
                back_to_first_rank,
                forced,
                time,
                Some(gpu_node),
                next,
            )?;
        }
    } else if step == back_to_first_rank {
        // Close the ring on the channel's first GPU.
        let first = topo.rank_to_gpu(graph.intra[graph.n_channels * ngpus])?;
        let gpu_node = topo.gpu_index(g);
        let first_node = topo.gpu_index(first);
        let closed = follow_path(topo, graph, Some(gpu_node), first_node, 1)?;
        if closed.is_some() {
            rec_gpu(
                topo,
                graph,
                save,
                first,
                step + 1,
                back_to_net,
                -1,
                forced,
                time,
            )?;
            follow_path(topo, graph, Some(gpu_node), first_node, -1)?;
        }
    } else {
        rec_gpu(
            topo, graph, save, gpu, ngpus as i32, -1, -1, forced, time,
        )?;
    }
    Ok(())
}

/// Channel start from the network side: pick an entry NIC, debit its
/// (asic, port) bandwidth pool and channel budget, then try first GPUs.
pub(crate) fn rec_net(
    topo: &mut Topology,
    graph: &mut SearchGraph,
    save: &mut SearchGraph,
    back_to_net: i32,
    back_to_first_rank: i32,
    time: &mut i64,
) -> Result<(), Error> {
    let bw = graph.bw_inter;
    for n in select_nets(topo, graph.type_inter, None) {
        {
            let nic = topo.nic(n);
            if graph.coll_net && !nic.coll_support {
                continue;
            }
            if nic.bw < bw {
                continue;
            }
            if nic.max_channels == 0 {
                continue;
            }
        }
        let net_id = topo.nic(n).id;
        let asic = topo.nic(n).asic;
        let port = topo.nic(n).port;
        graph.inter[graph.n_channels * 2] = net_id;
        graph.latency_inter = topo.nic(n).latency;

        for i in 0..topo.nnets() {
            if topo.nic(i).asic == asic && topo.nic(i).port == port {
                topo.nic_mut(i).bw -= bw;
            }
        }
        topo.nic_mut(n).max_channels -= 1;

        let net_node = topo.nic_index(n);

        // First try to replay the last channel.
        if graph.n_channels > 0 {
            let g = replay_gpu_at(topo, graph, 0)?;
            try_gpu(
                topo,
                graph,
                save,
                0,
                back_to_net,
                back_to_first_rank,
                ForcedOrder::Replay,
                time,
                Some(net_node),
                g,
            )?;
        }
        if graph.n_channels == 0 || !graph.same_channels {
            if graph.n_channels == 0 {
                // PCI-order probe from the GPU closest to the NIC, on its
                // own small budget so a hopeless order cannot eat the
                // caller's. GPU-direct capable GPUs win distance ties.
                let hops_to = |topo: &Topology, i: usize| {
                    topo.path_between(net_node, topo.gpu_index(i))
                        .map_or(usize::MAX, |path| path.count())
                };
                let mut f = 0;
                let mut f_gdr = false;
                for i in 0..topo.ngpus() {
                    if hops_to(topo, i) <= hops_to(topo, f) {
                        let gdr = gdr_ok(topo, i, n);
                        if hops_to(topo, i) < hops_to(topo, f) || (!f_gdr && gdr) {
                            f = i;
                            f_gdr = gdr;
                        }
                    }
                }
                let mut probe_time = SEARCH_TIMEOUT_PROBE;
                let forced = if f == 0 {
                    ForcedOrder::Pci
                } else {
                    ForcedOrder::None
                };
                try_gpu(
                    topo,
                    graph,
                    save,
                    0,
                    back_to_net,
                    back_to_first_rank,
                    forced,
                    &mut probe_time,
                    Some(net_node),
                    f,
                )?;
                if probe_time == -1 {
                    *time = -1;
                }
            }

            // Then try the most local GPUs.
            let mut max_bw = 0.0f32;
            let mut min_hops = usize::MAX;
            for g in 0..topo.ngpus() {
                if let Some(path) = topo.path_between(net_node, topo.gpu_index(g)) {
                    if path.bw > max_bw {
                        max_bw = path.bw;
                        min_hops = path.count();
                    } else if path.bw == max_bw && path.count() < min_hops {
                        min_hops = path.count();
                    }
                }
            }
            if max_bw >= bw {
                // Prefer GPUs that keep their PCIe attachment free of
                // two-way traffic across channels.
                for try_bidir in 0..2 {
                    for g in 0..topo.ngpus() {
                        let local = topo
                            .path_between(net_node, topo.gpu_index(g))
                            .map_or(false, |path| path.bw == max_bw && path.count() == min_hops);
                        if !local {
                            continue;
                        }
                        let gpu_used = if topo.gpu_pci_bw(g) > 0.0 { 0 } else { 1 };
                        if try_bidir == gpu_used {
                            try_gpu(
                                topo,
                                graph,
                                save,
                                0,
                                back_to_net,
                                back_to_first_rank,
                                ForcedOrder::None,
                                time,
                                Some(net_node),
                                g,
                            )?;
                        }
                    }
                }
            }
        }

        topo.nic_mut(n).max_channels += 1;
        for i in 0..topo.nnets() {
            if topo.nic(i).asic == asic && topo.nic(i).port == port {
                topo.nic_mut(i).bw += bw;
            }
        }
    }
    Ok(())
}

/// Where the pattern forces the channel to turn: the step at which it must
/// route back to a NIC, and the step at which a ring closes on its first
/// rank (-1 for never).
pub(crate) fn search_params(topo: &Topology, pattern: Pattern) -> (i32, i32) {
    if topo.nnets() > 0 && topo.ngpus() != topo.n_ranks() {
        let back_to_net = match pattern {
            Pattern::Ring => topo.ngpus() as i32 - 1,
            Pattern::SplitTree => 1,
            _ => 0,
        };
        (back_to_net, -1)
    } else {
        let back_to_first_rank = if pattern == Pattern::Ring {
            topo.ngpus() as i32 - 1
        } else {
            -1
        };
        (-1, back_to_first_rank)
    }
}

/// One full channel attempt: from the network when the job spans hosts,
/// otherwise from a GPU (sequential order first, then the previous
/// channel's order, then every start).
pub(crate) fn search_rec(
    topo: &mut Topology,
    graph: &mut SearchGraph,
    save: &mut SearchGraph,
    time: &mut i64,
) -> Result<(), Error> {
    let (back_to_net, back_to_first_rank) = search_params(topo, graph.pattern);
    if topo.nnets() > 0 && topo.ngpus() != topo.n_ranks() {
        rec_net(topo, graph, save, back_to_net, back_to_first_rank, time)?;
        return Ok(());
    }
    if graph.n_channels == 0 {
        try_gpu(
            topo,
            graph,
            save,
            0,
            back_to_net,
            back_to_first_rank,
            ForcedOrder::Pci,
            time,
            None,
            0,
        )?;
    } else {
        let g = replay_gpu_at(topo, graph, 0)?;
        try_gpu(
            topo,
            graph,
            save,
            0,
            back_to_net,
            back_to_first_rank,
            ForcedOrder::Replay,
            time,
            None,
            g,
        )?;
    }
    if !graph.same_channels || graph.n_channels == 0 {
        for g in 0..topo.ngpus() {
            try_gpu(
                topo,
                graph,
                save,
                0,
                back_to_net,
                back_to_first_rank,
                ForcedOrder::None,
                time,
                None,
                g,
            )?;
        }
    }
    Ok(())
}
