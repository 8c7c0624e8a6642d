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

//! the plan under construction and the returned artifact

use crate::specs::{LinkKind, Topology};
use serde::{Deserialize, Serialize};

/// Upper bound on channels a plan may carry.
pub const MAX_CHANNELS: usize = 32;

/// The shape of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    BalancedTree,
    SplitTree,
    Tree,
    Ring,
    CollNet,
}

/// A set of logical channels over a topology: which GPUs each channel
/// visits, which NICs it enters and leaves through, and the per-channel
/// bandwidth the plan reserves.
///
/// Created empty by the caller, then filled in place by the optimizer. The
/// search snapshots the best candidate seen so far by cloning.
#[derive(Clone, Debug)]
pub struct SearchGraph {
    pub id: i32,
    pub pattern: Pattern,
    /// Whether to restrict NIC choice to collective-capable NICs.
    pub coll_net: bool,
    /// 0 = entry and exit NIC must share (asic, port), 1 = may differ,
    /// 2 = decide automatically.
    pub cross_nic: i32,
    /// Bandwidth step currently attempted per channel, GPU-GPU segments.
    pub bw_intra: f32,
    /// Bandwidth step currently attempted per channel, GPU-NIC segments.
    pub bw_inter: f32,
    pub latency_inter: f32,
    /// Paths coarser than this are rejected on GPU-GPU segments.
    pub type_intra: LinkKind,
    /// Paths coarser than this are rejected on GPU-NIC segments.
    pub type_inter: LinkKind,
    pub n_channels: usize,
    pub min_channels: usize,
    pub max_channels: usize,
    /// When set, every channel must replay channel 0.
    pub same_channels: bool,
    /// Total hops across all channels, maintained incrementally.
    pub n_hops: i64,
    /// `intra[c * intra_stride + i]` = rank at position `i` of channel `c`.
    pub intra: Vec<i32>,
    /// `inter[c * 2]` / `inter[c * 2 + 1]` = NIC ids entering/leaving `c`.
    pub inter: Vec<i64>,
    /// Optional per-GPU NIC annotations for lateral egress,
    /// `intra_nets[(c * ngpus + i) * 2 + dir]`; -1 when absent.
    pub intra_nets: Vec<i64>,
    pub n_intra_channels: usize,
    /// Entries per channel in `intra`: the GPU count while searching, the
    /// local rank count after multi-rank expansion.
    pub intra_stride: usize,
}

impl SearchGraph {
    pub fn new(id: i32, pattern: Pattern) -> Self {
        Self {
            id,
            pattern,
            coll_net: false,
            cross_nic: 0,
            bw_intra: 0.0,
            bw_inter: 0.0,
            latency_inter: 0.0,
            type_intra: LinkKind::Nvl,
            type_inter: LinkKind::Pix,
            n_channels: 0,
            min_channels: 1,
            max_channels: MAX_CHANNELS,
            same_channels: true,
            n_hops: 0,
            intra: vec![],
            inter: vec![],
            intra_nets: vec![],
            n_intra_channels: 0,
            intra_stride: 0,
        }
    }

    /// Size the channel arrays for `topo` and clear any previous plan.
    pub fn prepare(&mut self, topo: &Topology) {
        let ngpus = topo.ngpus();
        let per_channel = topo.local_ranks().max(ngpus).max(1);
        self.max_channels = self.max_channels.min(MAX_CHANNELS);
        self.intra = vec![0; MAX_CHANNELS * per_channel];
        self.inter = vec![0; MAX_CHANNELS * 2];
        self.intra_nets = vec![-1; MAX_CHANNELS * ngpus.max(1) * 2];
        self.intra_stride = ngpus;
        self.n_channels = 0;
        self.n_intra_channels = 0;
        self.n_hops = 0;
    }

    /// The ranks visited by channel `c`, in order.
    pub fn channel_ranks(&self, c: usize) -> &[i32] {
        &self.intra[c * self.intra_stride..(c + 1) * self.intra_stride]
    }

    /// Entry and exit NIC ids of channel `c`.
    pub fn channel_nets(&self, c: usize) -> (i64, i64) {
        (self.inter[c * 2], self.inter[c * 2 + 1])
    }
}
