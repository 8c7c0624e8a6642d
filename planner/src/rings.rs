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

//! user-supplied ring lists
//!
//! A ring list spells out channels by hand: `0 1 2 3|3 2 1 0` is two
//! channels over four GPUs. Channels are separated by `|`; ranks by
//! whitespace or commas. Each channel must name every GPU exactly once
//! (any rank of a GPU stands for the GPU). Accepted lists bypass the
//! search entirely, so the planner takes the bandwidth on faith and
//! records the conservative fallback figures.

use crate::error::Error;
use crate::graph::{SearchGraph, MAX_CHANNELS};
use crate::specs::{LinkKind, Topology};

/// Parse `spec` into `graph`. Returns the number of channels installed.
pub fn parse_ring_list(
    spec: &str,
    topo: &Topology,
    graph: &mut SearchGraph,
) -> Result<usize, Error> {
    let ngpus = topo.ngpus();
    let channels: Vec<&str> = spec
        .split('|')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if channels.is_empty() {
        return Err(Error::InvalidRingList("no channels".to_string()));
    }
    if channels.len() > MAX_CHANNELS {
        return Err(Error::InvalidRingList(format!(
            "{} channels exceed the limit of {}",
            channels.len(),
            MAX_CHANNELS
        )));
    }

    for (c, channel) in channels.iter().enumerate() {
        let mut seen = vec![false; ngpus];
        let mut pos = 0;
        for token in channel.split(|ch: char| ch.is_whitespace() || ch == ',') {
            if token.is_empty() {
                continue;
            }
            let rank: i32 = token
                .parse()
                .map_err(|_| Error::InvalidRingList(format!("bad rank '{}'", token)))?;
            let g = topo
                .rank_to_gpu(rank)
                .map_err(|_| Error::InvalidRingList(format!("unknown rank {}", rank)))?;
            if seen[g] {
                return Err(Error::InvalidRingList(format!(
                    "gpu of rank {} listed twice in channel {}",
                    rank, c
                )));
            }
            if pos == ngpus {
                return Err(Error::InvalidRingList(format!(
                    "channel {} lists more than {} gpus",
                    c, ngpus
                )));
            }
            seen[g] = true;
            graph.intra[c * ngpus + pos] = topo.gpu(g).ranks[0];
            pos += 1;
        }
        if pos != ngpus {
            return Err(Error::InvalidRingList(format!(
                "channel {} names {} of {} gpus",
                c, pos, ngpus
            )));
        }
    }

    graph.n_channels = channels.len();
    graph.same_channels = false;
    graph.bw_intra = 0.1;
    graph.bw_inter = 0.1;
    graph.type_intra = LinkKind::Sys;
    graph.type_inter = LinkKind::Sys;
    Ok(channels.len())
}

#[cfg(test)]
mod rings_tests {
    use super::*;
    use crate::graph::Pattern;

    fn build_quad() -> Topology {
        let mut topo = Topology::new(4);
        let gpus: Vec<_> = (0..4).map(|d| topo.add_gpu(d, &[d], 80)).collect();
        for a in 0..4 {
            for b in a + 1..4 {
                topo.link_duplex(gpus[a], gpus[b], LinkKind::Nvl, 25.0);
            }
        }
        topo.finish();
        topo
    }

    fn blank_graph(topo: &Topology) -> SearchGraph {
        let mut graph = SearchGraph::new(0, Pattern::Ring);
        graph.prepare(topo);
        graph
    }

    #[test]
    fn test_parses_two_channels() {
        let topo = build_quad();
        let mut graph = blank_graph(&topo);
        let n = parse_ring_list("0 1 2 3|3 2 1 0", &topo, &mut graph).unwrap();
        assert_eq!(n, 2);
        assert_eq!(graph.n_channels, 2);
        assert_eq!(graph.channel_ranks(0), &[0, 1, 2, 3]);
        assert_eq!(graph.channel_ranks(1), &[3, 2, 1, 0]);
    }

    #[test]
    fn test_accepts_commas() {
        let topo = build_quad();
        let mut graph = blank_graph(&topo);
        assert_eq!(
            parse_ring_list("0,1,2,3", &topo, &mut graph).unwrap(),
            1
        );
    }

    #[test]
    fn test_rejects_unknown_rank() {
        let topo = build_quad();
        let mut graph = blank_graph(&topo);
        assert!(parse_ring_list("0 1 2 9", &topo, &mut graph).is_err());
    }

    #[test]
    fn test_rejects_incomplete_channel() {
        let topo = build_quad();
        let mut graph = blank_graph(&topo);
        assert!(parse_ring_list("0 1 2", &topo, &mut graph).is_err());
    }

    #[test]
    fn test_rejects_duplicate_gpu() {
        let topo = build_quad();
        let mut graph = blank_graph(&topo);
        assert!(parse_ring_list("0 1 2 2", &topo, &mut graph).is_err());
    }

    #[test]
    fn test_rejects_empty_list() {
        let topo = build_quad();
        let mut graph = blank_graph(&topo);
        assert!(parse_ring_list("  ", &topo, &mut graph).is_err());
    }

    #[test]
    fn test_multi_rank_gpu_counts_once() {
        let mut topo = Topology::new(4);
        let g0 = topo.add_gpu(0, &[0, 1], 80);
        let g1 = topo.add_gpu(1, &[2, 3], 80);
        topo.link_duplex(g0, g1, LinkKind::Nvl, 25.0);
        topo.finish();
        let mut graph = blank_graph(&topo);
        // Rank 2 stands for the second GPU; the channel stores its leading
        // rank.
        assert_eq!(parse_ring_list("0 2", &topo, &mut graph).unwrap(), 1);
        assert_eq!(graph.channel_ranks(0), &[0, 2]);
        // Naming two ranks of one GPU is a duplicate.
        assert!(parse_ring_list("0 1", &topo, &mut graph).is_err());
    }
}
