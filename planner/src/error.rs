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

use petgraph::prelude::*;
use std::fmt;

#[derive(Debug, PartialEq)]
pub enum Error {
    /// A rank that should be present on this node could not be resolved.
    InvalidRank(i32),
    /// A NIC id that should be present on this node could not be resolved.
    InvalidNet(i64),
    /// A device id (e.g. from an imported graph file) is not in the topology.
    InvalidDevice(i32),
    /// No reverse link between the two nodes; the topology is malformed.
    NoReverseLink(NodeIndex, NodeIndex),
    /// A replay was requested but no previous channel exists.
    NoPreviousChannel,
    /// The graph file could not be read or parsed.
    InvalidGraphFile(String),
    /// The graph file was produced by an incompatible version.
    VersionMismatch { found: u32, expected: u32 },
    /// The textual ring list is malformed or does not cover all ranks.
    InvalidRingList(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidRank(rank) => write!(f, "ERROR: could not find gpu rank {}", rank),
            Self::InvalidNet(id) => write!(f, "ERROR: could not find net id {:x}", id),
            Self::InvalidDevice(dev) => write!(f, "ERROR: device {} not found in topology", dev),
            Self::NoReverseLink(n1, n2) => {
                write!(
                    f,
                    "ERROR: no reverse link for {} -> {}",
                    n1.index(),
                    n2.index()
                )
            }
            Self::InvalidGraphFile(why) => write!(f, "ERROR: invalid graph file: {}", why),
            Self::VersionMismatch { found, expected } => {
                write!(
                    f,
                    "ERROR: graph file version {} does not match {}",
                    found, expected
                )
            }
            Self::InvalidRingList(why) => write!(f, "ERROR: invalid ring list: {}", why),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
