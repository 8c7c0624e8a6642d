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

//! candidate ordering for the next GPU of a channel
//!
//! The order is critical for the search to converge on a good solution
//! before its iteration budget runs out, even though it eventually explores
//! every candidate.

use crate::error::Error;
use crate::graph::SearchGraph;
use crate::specs::Topology;
use std::cmp::Ordering;

/// Score vector for one candidate GPU. Keys are listed least important
/// first; the comparator reads them in reverse.
#[derive(Clone, Debug)]
struct GpuScore {
    g: usize,
    start_index: usize,
    intra_nhops: usize,
    intra_bw: f32,
    inter_nhops: usize,
    inter_pci_bw: f32,
    inter_bw: f32,
}

fn cmp_score(a: &GpuScore, b: &GpuScore) -> Ordering {
    b.inter_bw
        .total_cmp(&a.inter_bw)
        .then(b.inter_pci_bw.total_cmp(&a.inter_pci_bw))
        .then(a.inter_nhops.cmp(&b.inter_nhops))
        .then(b.intra_bw.total_cmp(&a.intra_bw))
        .then(a.intra_nhops.cmp(&b.intra_nhops))
        .then(a.start_index.cmp(&b.start_index))
}

fn intra_scores_all_equal(scores: &[GpuScore]) -> bool {
    scores.iter().all(|score| {
        score.intra_bw == scores[0].intra_bw && score.intra_nhops == scores[0].intra_nhops
    })
}

/// Rank the GPUs not yet used by the channel under construction as
/// candidates to follow `gpu`.
///
/// `sort_net` = 0 scores intra keys only; 1 prefers candidates close to the
/// channel's entry NIC (the channel returns to it next step); -1 explores
/// the far side first when the intra keys cannot break ties.
pub(crate) fn next_gpu_order(
    topo: &Topology,
    graph: &SearchGraph,
    gpu: usize,
    sort_net: i32,
) -> Result<Vec<usize>, Error> {
    let flag = 1u64 << graph.n_channels;
    let ngpus = topo.ngpus();
    let net_node = if sort_net != 0 {
        let net_id = graph.inter[graph.n_channels * 2];
        Some(topo.nic_index(topo.net_to_index(net_id)?))
    } else {
        None
    };

    let mut scores = vec![];
    for i in 1..ngpus {
        let g = (gpu + i) % ngpus;
        let intra = match topo.path_between(topo.gpu_index(gpu), topo.gpu_index(g)) {
            Some(path) => path,
            // There is no path to that GPU.
            None => continue,
        };
        if topo.gpu(g).used & flag != 0 {
            continue;
        }
        let mut score = GpuScore {
            g,
            start_index: i,
            intra_nhops: intra.count(),
            intra_bw: intra.bw,
            inter_nhops: 0,
            inter_pci_bw: 0.0,
            inter_bw: 0.0,
        };
        if let Some(net_node) = net_node {
            if let Some(net_path) = topo.path_between(net_node, topo.gpu_index(g)) {
                score.inter_nhops = net_path.count();
                score.inter_bw = net_path.bw;
            }
            score.inter_pci_bw = topo.gpu_pci_bw(g);
        }
        scores.push(score);
    }

    scores.sort_by(cmp_score);

    // When nothing distinguishes the candidates locally, a back-to-NIC
    // preference of -1 walks them furthest first.
    if sort_net == -1 && intra_scores_all_equal(&scores) {
        scores.reverse();
    }
    Ok(scores.into_iter().map(|score| score.g).collect())
}
