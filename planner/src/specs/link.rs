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

//! links and precomputed paths between topology nodes

use crate::error::Error;
use petgraph::prelude::*;
use std::fmt;
use std::str::FromStr;

/// Proximity of a link or path, ordered from closest to most remote.
///
/// Physical links are tagged `Loc`, `Nvl`, `Pix` or `Sys`; the remaining
/// levels only arise as path types: `Nvb` (NVLink through an intermediate
/// GPU), `Pxb` (multiple PCIe switches), `Pxn` (lateral egress through a
/// peer GPU), `Phb` (through a CPU host bridge).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LinkKind {
    Loc = 0,
    Nvl = 1,
    Nvb = 2,
    Pix = 3,
    Pxb = 4,
    Pxn = 5,
    Phb = 6,
    Sys = 7,
}

impl LinkKind {
    pub const ALL: [LinkKind; 8] = [
        LinkKind::Loc,
        LinkKind::Nvl,
        LinkKind::Nvb,
        LinkKind::Pix,
        LinkKind::Pxb,
        LinkKind::Pxn,
        LinkKind::Phb,
        LinkKind::Sys,
    ];

    /// The next coarser level; saturates at `Sys`.
    pub fn next(self) -> LinkKind {
        let i = self as usize;
        if i + 1 < Self::ALL.len() {
            Self::ALL[i + 1]
        } else {
            LinkKind::Sys
        }
    }

    /// All levels from `Loc` through `upper`, in increasing coarseness.
    pub fn through(upper: LinkKind) -> impl Iterator<Item = LinkKind> {
        Self::ALL.into_iter().take(upper as usize + 1)
    }

    /// True for the PCIe hop level; bandwidth charged on these links is
    /// subject to the Intel P2P overhead adjustment.
    pub fn is_pci(self) -> bool {
        self == LinkKind::Pix
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LinkKind::Loc => "LOC",
            LinkKind::Nvl => "NVL",
            LinkKind::Nvb => "NVB",
            LinkKind::Pix => "PIX",
            LinkKind::Pxb => "PXB",
            LinkKind::Pxn => "PXN",
            LinkKind::Phb => "PHB",
            LinkKind::Sys => "SYS",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LinkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "LOC" => Ok(LinkKind::Loc),
            "NVL" => Ok(LinkKind::Nvl),
            "NVB" => Ok(LinkKind::Nvb),
            "PIX" => Ok(LinkKind::Pix),
            "PXB" => Ok(LinkKind::Pxb),
            "PXN" => Ok(LinkKind::Pxn),
            "PHB" => Ok(LinkKind::Phb),
            "SYS" => Ok(LinkKind::Sys),
            _ => Err(Error::InvalidGraphFile(format!("unknown link type {}", s))),
        }
    }
}

/// A directed link between two nodes. The petgraph edge weight.
///
/// `bw` is the bandwidth currently available, in GB/s; the search debits and
/// credits it as channels are tried. The reverse partner is the
/// opposite-direction edge between the same endpoints.
#[derive(Clone, Debug)]
pub struct Link {
    pub kind: LinkKind,
    pub bw: f32,
}

impl Link {
    pub fn new(kind: LinkKind, bw: f32) -> Self {
        Self { kind, bw }
    }
}

/// A precomputed directed path: the ordered hop links from a source node to
/// a destination node, the coarsest proximity along it, and the bottleneck
/// bandwidth before any reservations.
#[derive(Clone, Debug)]
pub struct Path {
    pub hops: Vec<EdgeIndex>,
    pub kind: LinkKind,
    pub bw: f32,
}

impl Path {
    pub fn count(&self) -> usize {
        self.hops.len()
    }
}

#[cfg(test)]
mod link_tests {
    use super::*;

    #[test]
    fn test_kind_order() {
        assert!(LinkKind::Loc < LinkKind::Nvl);
        assert!(LinkKind::Nvl < LinkKind::Pix);
        assert!(LinkKind::Pix < LinkKind::Pxb);
        assert!(LinkKind::Phb < LinkKind::Sys);
    }

    #[test]
    fn test_kind_next_saturates() {
        assert_eq!(LinkKind::Loc.next(), LinkKind::Nvl);
        assert_eq!(LinkKind::Phb.next(), LinkKind::Sys);
        assert_eq!(LinkKind::Sys.next(), LinkKind::Sys);
    }

    #[test]
    fn test_kind_through() {
        let levels: Vec<LinkKind> = LinkKind::through(LinkKind::Pix).collect();
        assert_eq!(
            levels,
            vec![LinkKind::Loc, LinkKind::Nvl, LinkKind::Nvb, LinkKind::Pix]
        );
    }

    #[test]
    fn test_kind_roundtrip_names() {
        for kind in LinkKind::ALL {
            assert_eq!(kind.to_string().parse::<LinkKind>().unwrap(), kind);
        }
        assert!("XXX".parse::<LinkKind>().is_err());
    }
}
