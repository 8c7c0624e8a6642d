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

//! predefined topologies
//!
//! Small systems with known shapes, used by the tests and the demo binary.
//! Real deployments feed a discovered topology instead.

use crate::specs::{CpuArch, CpuVendor, LinkKind, NicInfo, Topology};

fn nic(id: i64, asic: i64) -> NicInfo {
    NicInfo {
        id,
        asic,
        port: 0,
        bw: 25.0,
        latency: 1.0,
        max_channels: 4,
        coll_support: false,
        gdr: true,
    }
}

/// One GPU, no NICs.
pub fn single_gpu() -> Topology {
    let mut topo = Topology::new(1);
    topo.add_gpu(0, &[0], 80);
    topo.finish();
    topo
}

/// Two GPUs joined by an accelerator interconnect of `bw` each way.
pub fn nvlink_pair(bw: f32) -> Topology {
    let mut topo = Topology::new(2);
    let g0 = topo.add_gpu(0, &[0], 80);
    let g1 = topo.add_gpu(1, &[1], 80);
    topo.link_duplex(g0, g1, LinkKind::Nvl, bw);
    topo.finish();
    topo
}

/// Like `nvlink_pair`, with two ranks per GPU.
pub fn nvlink_pair_multi_rank(bw: f32) -> Topology {
    let mut topo = Topology::new(4);
    let g0 = topo.add_gpu(0, &[0, 1], 80);
    let g1 = topo.add_gpu(1, &[2, 3], 80);
    topo.link_duplex(g0, g1, LinkKind::Nvl, bw);
    topo.finish();
    topo
}

/// A fully connected NVLink quad; the (0, 1) pair runs at `fast`, every
/// other pair at `slow`.
pub fn nvlink_quad(fast: f32, slow: f32) -> Topology {
    let mut topo = Topology::new(4);
    let gpus: Vec<_> = (0..4).map(|d| topo.add_gpu(d, &[d], 80)).collect();
    for a in 0..4 {
        for b in a + 1..4 {
            let bw = if a == 0 && b == 1 { fast } else { slow };
            topo.link_duplex(gpus[a], gpus[b], LinkKind::Nvl, bw);
        }
    }
    topo.finish();
    topo
}

/// Two PCIe-switch pairs under one Intel CPU, one NIC per switch. Part of
/// an 8-rank job, so channels go through the network.
pub fn dual_switch_host() -> Topology {
    let mut topo = Topology::new(8);
    let g0 = topo.add_gpu(0, &[0], 80);
    let g1 = topo.add_gpu(1, &[1], 80);
    let g2 = topo.add_gpu(2, &[2], 80);
    let g3 = topo.add_gpu(3, &[3], 80);
    let cpu = topo.add_cpu(CpuArch::X86, CpuVendor::Intel);
    let s0 = topo.add_pci_switch();
    let s1 = topo.add_pci_switch();
    let n0 = topo.add_nic(nic(0, 0));
    let n1 = topo.add_nic(nic(1, 1));
    topo.link_duplex(g0, s0, LinkKind::Pix, 24.0);
    topo.link_duplex(g1, s0, LinkKind::Pix, 24.0);
    topo.link_duplex(g2, s1, LinkKind::Pix, 24.0);
    topo.link_duplex(g3, s1, LinkKind::Pix, 24.0);
    topo.link_duplex(s0, cpu, LinkKind::Pix, 24.0);
    topo.link_duplex(s1, cpu, LinkKind::Pix, 24.0);
    topo.link_duplex(n0, s0, LinkKind::Pix, 24.0);
    topo.link_duplex(n1, s1, LinkKind::Pix, 24.0);
    topo.finish();
    topo
}

/// Four GPUs and one NIC on a single PCIe switch, in an 8-rank job.
pub fn single_nic_host() -> Topology {
    let mut topo = Topology::new(8);
    let gpus: Vec<_> = (0..4).map(|d| topo.add_gpu(d, &[d], 80)).collect();
    let s0 = topo.add_pci_switch();
    let n0 = topo.add_nic(nic(0, 0));
    for gpu in gpus {
        topo.link_duplex(gpu, s0, LinkKind::Pix, 24.0);
    }
    topo.link_duplex(n0, s0, LinkKind::Pix, 24.0);
    topo.finish();
    topo
}

/// Two GPUs with no connectivity at all; nothing can route.
pub fn disconnected_pair() -> Topology {
    let mut topo = Topology::new(2);
    topo.add_gpu(0, &[0], 80);
    topo.add_gpu(1, &[1], 80);
    topo.finish();
    topo
}

#[cfg(test)]
mod predefined_tests {
    use super::*;

    #[test]
    fn test_shapes() {
        assert_eq!(single_gpu().ngpus(), 1);
        assert_eq!(nvlink_pair(50.0).ngpus(), 2);
        assert_eq!(nvlink_pair_multi_rank(50.0).local_ranks(), 4);
        let quad = nvlink_quad(20.0, 12.0);
        assert_eq!(quad.ngpus(), 4);
        assert_eq!(quad.max_bw(), 20.0);
        let host = dual_switch_host();
        assert_eq!(host.ngpus(), 4);
        assert_eq!(host.nnets(), 2);
        assert_eq!(host.max_bw(), 24.0);
        assert_eq!(single_nic_host().nnets(), 1);
        assert_eq!(disconnected_pair().max_bw(), 0.0);
    }
}
