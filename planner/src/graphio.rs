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

//! plan import/export and the human-readable summary
//!
//! Plans serialize to a small attribute tree (`graphs` -> `graph` ->
//! `channel` -> ordered `net`/`gpu` steps) keyed by device ids, so a dump
//! taken on one run can be replayed on the next or inspected by hand.

use crate::error::Error;
use crate::graph::{Pattern, SearchGraph};
use crate::specs::Topology;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Bumped whenever the file layout changes; imports refuse other versions.
pub const GRAPH_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct GraphsFile {
    version: u32,
    graphs: Vec<GraphEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphEntry {
    id: i32,
    pattern: Pattern,
    crossnic: i32,
    nchannels: usize,
    speedintra: f32,
    speedinter: f32,
    #[serde(default)]
    latencyinter: f32,
    typeintra: String,
    typeinter: String,
    samechannels: i32,
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChannelEntry {
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    steps: Vec<Step>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Step {
    Net { dev: i64 },
    Gpu { dev: i32 },
}

fn channel_entry(topo: &Topology, graph: &SearchGraph, c: usize) -> Result<ChannelEntry, Error> {
    let mut steps = vec![];
    if topo.nnets() > 0 {
        steps.push(Step::Net {
            dev: graph.inter[c * 2],
        });
    }
    let mut last_dev = None;
    for rank in graph.channel_ranks(c) {
        let g = topo.rank_to_gpu(*rank)?;
        let dev = topo.gpu(g).dev;
        // Ranks sharing a GPU collapse to one step.
        if last_dev != Some(dev) {
            steps.push(Step::Gpu { dev });
            last_dev = Some(dev);
        }
    }
    if topo.nnets() > 0 {
        steps.push(Step::Net {
            dev: graph.inter[c * 2 + 1],
        });
    }
    Ok(ChannelEntry { steps })
}

/// Render plans to the exchange format.
pub fn render_graphs(topo: &Topology, graphs: &[&SearchGraph]) -> Result<String, Error> {
    let mut entries = vec![];
    for graph in graphs {
        let channels = (0..graph.n_channels)
            .map(|c| channel_entry(topo, graph, c))
            .collect::<Result<Vec<_>, Error>>()?;
        entries.push(GraphEntry {
            id: graph.id,
            pattern: graph.pattern,
            crossnic: graph.cross_nic,
            nchannels: graph.n_channels,
            speedintra: graph.bw_intra,
            speedinter: graph.bw_inter,
            latencyinter: graph.latency_inter,
            typeintra: graph.type_intra.to_string(),
            typeinter: graph.type_inter.to_string(),
            samechannels: graph.same_channels as i32,
            channels,
        });
    }
    let file = GraphsFile {
        version: GRAPH_FILE_VERSION,
        graphs: entries,
    };
    serde_yaml::to_string(&file).map_err(|err| Error::InvalidGraphFile(err.to_string()))
}

/// Write plans to `path`.
pub fn dump_graphs(topo: &Topology, graphs: &[&SearchGraph], path: &Path) -> Result<(), Error> {
    let rendered = render_graphs(topo, graphs)?;
    fs::write(path, rendered).map_err(|err| Error::InvalidGraphFile(err.to_string()))
}

fn apply_entry(
    entry: &GraphEntry,
    topo: &Topology,
    graph: &mut SearchGraph,
) -> Result<usize, Error> {
    if entry.id != graph.id {
        return Ok(0);
    }
    // An import must not grant cross-NIC freedom the caller refused.
    if graph.cross_nic == 0 && entry.crossnic == 1 {
        return Ok(0);
    }
    if entry.nchannels > crate::graph::MAX_CHANNELS
        || entry.channels.len() > crate::graph::MAX_CHANNELS
    {
        return Err(Error::InvalidGraphFile(format!(
            "{} channels exceed the limit of {}",
            entry.nchannels.max(entry.channels.len()),
            crate::graph::MAX_CHANNELS
        )));
    }
    graph.cross_nic = entry.crossnic;
    graph.pattern = entry.pattern;
    graph.n_channels = entry.nchannels;
    graph.bw_intra = entry.speedintra;
    graph.bw_inter = entry.speedinter;
    graph.latency_inter = entry.latencyinter;
    graph.type_intra = entry.typeintra.parse()?;
    graph.type_inter = entry.typeinter.parse()?;
    graph.same_channels = entry.samechannels != 0;

    let ngpus = topo.ngpus();
    for (c, channel) in entry.channels.iter().enumerate() {
        let mut n = 0;
        let mut g = 0;
        for step in &channel.steps {
            match step {
                Step::Net { dev } => {
                    if n == 2 {
                        return Err(Error::InvalidGraphFile(format!(
                            "channel {} has more than two net steps",
                            c
                        )));
                    }
                    graph.inter[c * 2 + n] = *dev;
                    n += 1;
                }
                Step::Gpu { dev } => {
                    if g == ngpus {
                        return Err(Error::InvalidGraphFile(format!(
                            "channel {} has more than {} gpu steps",
                            c, ngpus
                        )));
                    }
                    let gpu = match topo.dev_to_gpu(*dev) {
                        Ok(gpu) => gpu,
                        Err(err) => {
                            warn!("graph import: dev {} not found", dev);
                            return Err(err);
                        }
                    };
                    graph.intra[c * ngpus + g] = topo.gpu(gpu).ranks[0];
                    g += 1;
                }
            }
        }
    }
    Ok(entry.channels.len())
}

/// Apply the first matching plan of a rendered file to `graph`. Returns
/// the number of channels taken over (0 when nothing applied).
pub fn apply_graphs(rendered: &str, topo: &Topology, graph: &mut SearchGraph) -> Result<usize, Error> {
    let file: GraphsFile =
        serde_yaml::from_str(rendered).map_err(|err| Error::InvalidGraphFile(err.to_string()))?;
    if file.version != GRAPH_FILE_VERSION {
        return Err(Error::VersionMismatch {
            found: file.version,
            expected: GRAPH_FILE_VERSION,
        });
    }
    let mut loaded = 0;
    for entry in &file.graphs {
        loaded += apply_entry(entry, topo, graph)?;
    }
    Ok(loaded)
}

/// Load a plan for `graph.id` from `path`.
pub fn load_graph(path: &Path, topo: &Topology, graph: &mut SearchGraph) -> Result<usize, Error> {
    let rendered =
        fs::read_to_string(path).map_err(|err| Error::InvalidGraphFile(err.to_string()))?;
    apply_graphs(&rendered, topo, graph)
}

/// Log a per-channel summary of the plan.
pub fn print_graph(topo: &Topology, graph: &SearchGraph) {
    info!(
        "pattern {:?}, crossNic {}, nChannels {}, bw {}/{}, type {}/{}, sameChannels {}",
        graph.pattern,
        graph.cross_nic,
        graph.n_channels,
        graph.bw_intra,
        graph.bw_inter,
        graph.type_intra,
        graph.type_inter,
        graph.same_channels as i32
    );
    let ngpus = topo.ngpus();
    let show_flanks =
        topo.nnets() > 0 && topo.ngpus() != topo.n_ranks() && graph.n_intra_channels == 0;
    for c in 0..graph.n_channels {
        let mut line = format!("{:2} :", c);
        if show_flanks {
            line += &format!(" NET/{}", graph.inter[c * 2]);
        }
        for (i, rank) in graph.channel_ranks(c).iter().enumerate() {
            if graph.intra_stride == ngpus {
                let lateral = graph.intra_nets[(ngpus * c + i) * 2];
                if lateral >= 0 && (lateral as usize) < topo.nnets() {
                    line += &format!(" NET/{}", lateral);
                }
            }
            line += &format!(" GPU/{}", rank);
            if graph.intra_stride == ngpus {
                let lateral = graph.intra_nets[(ngpus * c + i) * 2 + 1];
                if lateral >= 0 && (lateral as usize) < topo.nnets() {
                    line += &format!(" NET/{}", lateral);
                }
            }
        }
        if show_flanks {
            line += &format!(" NET/{}", graph.inter[c * 2 + 1]);
        }
        info!("{}", line);
    }
}

#[cfg(test)]
mod graphio_tests {
    use super::*;
    use crate::specs::{LinkKind, NicInfo};

    fn build_host() -> Topology {
        let mut topo = Topology::new(8);
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
        topo.link_duplex(g0, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(g1, s0, LinkKind::Pix, 24.0);
        topo.link_duplex(n0, s0, LinkKind::Pix, 24.0);
        topo.finish();
        topo
    }

    fn build_plan(topo: &Topology) -> SearchGraph {
        let mut graph = SearchGraph::new(3, Pattern::Ring);
        graph.prepare(topo);
        graph.cross_nic = 0;
        graph.bw_intra = 12.0;
        graph.bw_inter = 12.0;
        graph.latency_inter = 1.5;
        graph.type_intra = LinkKind::Pix;
        graph.type_inter = LinkKind::Pix;
        graph.same_channels = false;
        graph.n_channels = 2;
        graph.intra[..4].copy_from_slice(&[0, 1, 1, 0]);
        graph.inter[..4].copy_from_slice(&[0, 0, 0, 0]);
        graph
    }

    #[test]
    fn test_round_trip_preserves_plan() {
        let topo = build_host();
        let plan = build_plan(&topo);
        let rendered = render_graphs(&topo, &[&plan]).unwrap();

        let mut restored = SearchGraph::new(3, Pattern::Tree);
        restored.prepare(&topo);
        let loaded = apply_graphs(&rendered, &topo, &mut restored).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(restored.pattern, Pattern::Ring);
        assert_eq!(restored.cross_nic, 0);
        assert_eq!(restored.n_channels, 2);
        assert_eq!(restored.bw_intra, 12.0);
        assert_eq!(restored.bw_inter, 12.0);
        assert_eq!(restored.latency_inter, 1.5);
        assert_eq!(restored.type_intra, LinkKind::Pix);
        assert_eq!(restored.type_inter, LinkKind::Pix);
        assert!(!restored.same_channels);
        assert_eq!(&restored.intra[..4], &[0, 1, 1, 0]);
        assert_eq!(&restored.inter[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_round_trip_through_file() {
        let topo = build_host();
        let plan = build_plan(&topo);
        let path = std::env::temp_dir().join("planner_graphio_roundtrip.yaml");
        dump_graphs(&topo, &[&plan], &path).unwrap();
        let mut restored = SearchGraph::new(3, Pattern::Tree);
        restored.prepare(&topo);
        assert_eq!(load_graph(&path, &topo, &mut restored).unwrap(), 2);
        assert_eq!(restored.n_channels, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_version_mismatch_is_refused() {
        let topo = build_host();
        let plan = build_plan(&topo);
        let rendered = render_graphs(&topo, &[&plan]).unwrap();
        let bumped = rendered.replace(
            &format!("version: {}", GRAPH_FILE_VERSION),
            "version: 99",
        );
        let mut restored = SearchGraph::new(3, Pattern::Tree);
        restored.prepare(&topo);
        assert_eq!(
            apply_graphs(&bumped, &topo, &mut restored),
            Err(Error::VersionMismatch {
                found: 99,
                expected: GRAPH_FILE_VERSION
            })
        );
    }

    #[test]
    fn test_other_ids_are_ignored() {
        let topo = build_host();
        let plan = build_plan(&topo);
        let rendered = render_graphs(&topo, &[&plan]).unwrap();
        let mut restored = SearchGraph::new(7, Pattern::Tree);
        restored.prepare(&topo);
        assert_eq!(apply_graphs(&rendered, &topo, &mut restored).unwrap(), 0);
        assert_eq!(restored.n_channels, 0);
        assert_eq!(restored.pattern, Pattern::Tree);
    }

    #[test]
    fn test_cross_nic_grant_is_not_imported() {
        let topo = build_host();
        let mut plan = build_plan(&topo);
        plan.cross_nic = 1;
        let rendered = render_graphs(&topo, &[&plan]).unwrap();
        let mut restored = SearchGraph::new(3, Pattern::Tree);
        restored.prepare(&topo);
        restored.cross_nic = 0;
        // The file says crossnic=1 but the caller asked for 0; the import
        // is ignored rather than overriding.
        assert_eq!(apply_graphs(&rendered, &topo, &mut restored).unwrap(), 0);
        assert_eq!(restored.n_channels, 0);
    }

    #[test]
    fn test_unknown_device_is_an_error() {
        let topo = build_host();
        let rendered = "\
version: 1
graphs:
- id: 3
  pattern: ring
  crossnic: 0
  nchannels: 1
  speedintra: 10.0
  speedinter: 10.0
  latencyinter: 0.0
  typeintra: PIX
  typeinter: PIX
  samechannels: 1
  channels:
  - steps:
    - net:
        dev: 0
    - gpu:
        dev: 9
    - net:
        dev: 0
";
        let mut restored = SearchGraph::new(3, Pattern::Tree);
        restored.prepare(&topo);
        assert_eq!(
            apply_graphs(rendered, &topo, &mut restored),
            Err(Error::InvalidDevice(9))
        );
    }
}
