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

use env_logger::Target;
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

use planner::{compute, dump_graphs, predefined, print_graph, Config, Pattern, SearchGraph};

#[derive(Debug)]
enum TopologyName {
    SingleGpu,
    NvlinkPair,
    NvlinkQuad,
    DualSwitchHost,
    SingleNicHost,
}

impl FromStr for TopologyName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "single-gpu" => Ok(Self::SingleGpu),
            "nvlink-pair" => Ok(Self::NvlinkPair),
            "nvlink-quad" => Ok(Self::NvlinkQuad),
            "dual-switch-host" => Ok(Self::DualSwitchHost),
            "single-nic-host" => Ok(Self::SingleNicHost),
            _ => Err(format!("unknown topology '{}'", s)),
        }
    }
}

#[derive(Debug)]
struct PatternArg(Pattern);

impl FromStr for PatternArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "ring" => Ok(Self(Pattern::Ring)),
            "tree" => Ok(Self(Pattern::Tree)),
            "split-tree" => Ok(Self(Pattern::SplitTree)),
            "balanced-tree" => Ok(Self(Pattern::BalancedTree)),
            _ => Err(format!("unknown pattern '{}'", s)),
        }
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "planctl",
    about = "Plan collective-communication channels over a predefined topology"
)]
struct Arguments {
    /// supported topologies: single-gpu, nvlink-pair, nvlink-quad,
    /// dual-switch-host, single-nic-host
    #[structopt(short, long, default_value = "nvlink-pair")]
    topology: TopologyName,
    /// supported patterns: ring, tree, split-tree, balanced-tree
    #[structopt(short, long, default_value = "ring")]
    pattern: PatternArg,
    /// channel ceiling for the plan
    #[structopt(short, long, default_value = "8")]
    max_channels: usize,
    /// write the plan to this file after planning
    #[structopt(short, long)]
    dump: Option<PathBuf>,
}

fn main() {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("planner"), log::LevelFilter::Info)
        .filter(Some("planctl"), log::LevelFilter::Info)
        .target(Target::Stderr)
        .init();

    let mut topo = match args.topology {
        TopologyName::SingleGpu => predefined::single_gpu(),
        TopologyName::NvlinkPair => predefined::nvlink_pair(50.0),
        TopologyName::NvlinkQuad => predefined::nvlink_quad(20.0, 12.0),
        TopologyName::DualSwitchHost => predefined::dual_switch_host(),
        TopologyName::SingleNicHost => predefined::single_nic_host(),
    };

    let mut config = Config::from_env();
    if let Some(path) = args.dump {
        config.graph_dump_file = Some(path);
    }

    let mut graph = SearchGraph::new(0, args.pattern.0);
    graph.max_channels = args.max_channels;
    compute(&mut topo, &mut graph, &config).expect("Failed to plan channels");
    print_graph(&topo, &graph);

    if let Some(path) = &config.graph_dump_file {
        dump_graphs(&topo, &[&graph], path).expect("Failed to dump the plan");
        log::info!("plan written to {}", path.display());
    }
}
