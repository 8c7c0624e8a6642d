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

//! the outer optimization loop
//!
//! Runs the channel search over a shrinking parameter vector until a
//! solution is optimal, the iteration budget runs out, or the sweep is
//! exhausted: toggle channel replay, coarsen the intra then inter link-type
//! thresholds, permit cross-NIC, degrade split trees, then step down the
//! bandwidth table. A second pass tries to grow the intra bandwidth for
//! tree shapes. Whatever happens, the caller gets a usable plan: a
//! degenerate single channel is installed when the search comes up empty.

use crate::config::Config;
use crate::error::Error;
use crate::graph::{Pattern, SearchGraph};
use crate::graphio::load_graph;
use crate::rings::parse_ring_list;
use crate::search::{
    search_rec, SEARCH_GLOBAL_TIMEOUT, SEARCH_TIMEOUT, SEARCH_TIMEOUT_SAMECHANNELS,
    SEARCH_TIMEOUT_TREE,
};
use crate::specs::{LinkKind, Topology};
use log::{info, trace, warn};

/// Bandwidth steps tried per channel, best first, when no NIC is present.
const SPEEDS_INTRA: [f32; 13] = [
    44.0, 30.0, 22.0, 18.0, 15.0, 12.0, 10.0, 9.0, 7.0, 6.0, 5.0, 4.0, 3.0,
];
/// Bandwidth steps tried per channel, best first, with NICs in play.
const SPEEDS_INTER: [f32; 19] = [
    48.0, 30.0, 28.0, 24.0, 22.0, 18.0, 15.0, 12.0, 10.0, 9.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.4, 1.2,
    0.24, 0.12,
];

/// Abundant intra bandwidth: worth splitting channels in two for better
/// pipelining.
const DUPLICATE_BW_THRESHOLD: f32 = 25.0;

fn first_fit(speeds: &[f32], limit: f32) -> usize {
    let mut i = 0;
    while speeds[i] > limit && i < speeds.len() - 1 {
        i += 1;
    }
    i
}

/// Replace each per-GPU entry of every channel by the GPU's full ordered
/// rank list, producing the final layout used downstream.
fn expand_multi_rank(topo: &Topology, graph: &mut SearchGraph) {
    let ngpus = topo.ngpus();
    if ngpus == 0 {
        return;
    }
    trace!(
        "expanding intra array for multi-rank GPUs, nChannels {}",
        graph.n_channels
    );
    let leads: Vec<i32> = graph.intra[..graph.n_channels * ngpus].to_vec();
    let mut at = 0;
    for c in 0..graph.n_channels {
        for i in 0..ngpus {
            for j in 0..ngpus {
                if leads[c * ngpus + i] == topo.gpu(j).ranks[0] {
                    for rank in &topo.gpu(j).ranks {
                        graph.intra[at] = *rank;
                        at += 1;
                    }
                }
            }
        }
    }
    graph.intra_stride = topo.local_ranks();
}

/// Produce a plan for `graph` over `topo`.
///
/// Honors an imported plan or a user ring list from `config` before
/// searching. On return the graph holds a complete set of channels, or the
/// degenerate fallback channel when nothing satisfied the pattern even
/// fully relaxed.
pub fn compute(topo: &mut Topology, graph: &mut SearchGraph, config: &Config) -> Result<(), Error> {
    let ngpus = topo.ngpus();
    graph.prepare(topo);
    graph.cross_nic = config.cross_nic;
    let cross_nic_allowed = topo.nnets() > 1 && graph.cross_nic != 0;
    graph.bw_intra = 0.0;
    graph.bw_inter = 0.0;
    graph.latency_inter = 0.0;
    if graph.cross_nic == 2 {
        graph.cross_nic = 0;
    }
    graph.type_intra = if ngpus == 1 {
        LinkKind::Loc
    } else {
        LinkKind::Nvl
    };
    graph.type_inter = LinkKind::Pix;
    graph.same_channels = true;

    if let Some(path) = &config.graph_file {
        let loaded = load_graph(path, topo, graph)?;
        info!(
            "search {}: {} channels loaded from {}",
            graph.id,
            loaded,
            path.display()
        );
        if graph.n_channels > 0 {
            expand_multi_rank(topo, graph);
            return Ok(());
        }
    }
    if let Some(spec) = &config.ring_spec {
        parse_ring_list(spec, topo, graph)?;
        if graph.n_channels > 0 {
            expand_multi_rank(topo, graph);
            return Ok(());
        }
    }

    // A lone GPU cannot shape anything but a trivial ring or tree.
    if ngpus == 1 && graph.pattern != Pattern::Ring {
        graph.pattern = Pattern::Tree;
    }

    let mut tmp = graph.clone();
    let speeds: &[f32] = if topo.nnets() == 0 {
        &SPEEDS_INTRA
    } else {
        &SPEEDS_INTER
    };
    let nspeeds = speeds.len();
    let mut speed_index = first_fit(speeds, topo.max_bw());
    tmp.bw_intra = speeds[speed_index];
    tmp.bw_inter = speeds[speed_index];
    let mut global_timeout = SEARCH_GLOBAL_TIMEOUT;
    let mut pass = 1;
    let mut time;

    loop {
        time = if tmp.same_channels {
            SEARCH_TIMEOUT_SAMECHANNELS
        } else if tmp.pattern == Pattern::Tree {
            SEARCH_TIMEOUT_TREE
        } else {
            SEARCH_TIMEOUT
        };
        tmp.n_channels = 0;
        global_timeout -= time;
        search_rec(topo, &mut tmp, graph, &mut time)?;
        trace!(
            "pattern {:?}, crossNic {}, bw {}/{}, type {}/{}, sameChannels {} -> nChannels {}x{}/{}",
            tmp.pattern,
            tmp.cross_nic,
            tmp.bw_inter,
            tmp.bw_intra,
            tmp.type_inter,
            tmp.type_intra,
            tmp.same_channels as i32,
            graph.n_channels,
            graph.bw_inter,
            graph.bw_intra
        );

        let mut done =
            time == -1 || graph.n_channels as f32 * graph.bw_inter >= topo.total_bw();

        if !done && pass == 1 {
            // Relax one knob and restart; knobs reset as the next one
            // engages, so the sweep walks the whole grid.
            if tmp.same_channels {
                tmp.same_channels = false;
                continue;
            }
            tmp.same_channels = true;

            if time != -1 {
                global_timeout += time;
            } else {
                global_timeout = SEARCH_GLOBAL_TIMEOUT;
            }
            if global_timeout < 0 && graph.n_channels > 0 {
                done = true;
            }

            if !done {
                let max_type_intra = if topo.nnets() > 0 {
                    tmp.type_inter
                } else {
                    LinkKind::Sys
                };
                if tmp.type_intra < max_type_intra
                    && (graph.n_channels == 0 || tmp.type_intra < graph.type_intra)
                {
                    tmp.type_intra = tmp.type_intra.next();
                    continue;
                }
                tmp.type_intra = if ngpus == 1 {
                    LinkKind::Loc
                } else {
                    LinkKind::Nvl
                };

                if topo.nnets() > 0
                    && tmp.type_inter < LinkKind::Sys
                    && (graph.n_channels == 0
                        || tmp.type_inter < graph.type_inter
                        || tmp.type_inter < LinkKind::Pxn)
                {
                    tmp.type_inter = tmp.type_inter.next();
                    continue;
                }
                tmp.type_inter = LinkKind::Pix;

                if cross_nic_allowed && tmp.cross_nic == 0 {
                    tmp.cross_nic = 1;
                    continue;
                }
                tmp.cross_nic = 0;

                // A split tree that cannot route may still work as a plain
                // tree.
                if tmp.pattern == Pattern::SplitTree {
                    tmp.pattern = Pattern::Tree;
                    continue;
                }
                tmp.pattern = graph.pattern;

                // Step the bandwidth down, but never below half of what is
                // already achieved.
                if speed_index < nspeeds - 1
                    && (graph.n_channels == 0
                        || speeds[speed_index + 1] / graph.bw_inter > 0.49)
                {
                    speed_index += 1;
                    tmp.bw_intra = speeds[speed_index];
                    tmp.bw_inter = speeds[speed_index];
                    continue;
                }
                speed_index = first_fit(speeds, topo.max_bw());
                tmp.bw_intra = speeds[speed_index];
                tmp.bw_inter = speeds[speed_index];
            }
        }

        if pass == 1 {
            // Lock in what we have and refine from there.
            time = -1;
            tmp.clone_from(graph);
            speed_index = first_fit(speeds, graph.bw_inter);
            tmp.bw_intra = speeds[speed_index];
            tmp.bw_inter = speeds[speed_index];
            tmp.min_channels = graph.n_channels;
            pass = 2;
        }

        if pass == 2 {
            // Trees pipeline better when the intra segments run ahead of
            // the NIC; try the next larger step while it stays under twice
            // the inter bandwidth.
            if time != 0
                && graph.pattern != Pattern::Ring
                && tmp.bw_intra == graph.bw_intra
                && tmp.bw_intra < tmp.bw_inter * 2.0
                && speed_index > 0
            {
                speed_index -= 1;
                tmp.bw_intra = speeds[speed_index];
                continue;
            }
            break;
        }
    }

    if graph.n_channels == 0 && !graph.coll_net {
        warn!(
            "could not find a path for pattern {:?}, falling back to simple order",
            graph.pattern
        );
        for i in 0..ngpus {
            graph.intra[i] = topo.gpu(i).ranks[0];
        }
        graph.inter[0] = 0;
        graph.inter[1] = 0;
        graph.bw_intra = 0.1;
        graph.bw_inter = 0.1;
        graph.type_intra = LinkKind::Sys;
        graph.type_inter = LinkKind::Sys;
        graph.n_channels = 1;
    }

    if graph.bw_intra >= DUPLICATE_BW_THRESHOLD {
        let n = graph.n_channels;
        let dup = (n * 2).min(graph.max_channels);
        graph.intra.copy_within(0..(dup - n) * ngpus, n * ngpus);
        graph.inter.copy_within(0..(dup - n) * 2, n * 2);
        let factor = (dup + n - 1) / n;
        graph.bw_intra /= factor as f32;
        graph.bw_inter /= factor as f32;
        graph.n_channels = dup;
    }

    expand_multi_rank(topo, graph);
    Ok(())
}
