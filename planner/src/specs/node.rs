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

//! nodes in a discovered topology

/// CPU microarchitecture family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuArch {
    X86,
    Power,
    Arm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Other,
}

/// A GPU and the job ranks it hosts. Multiple ranks may share one GPU.
#[derive(Clone, Debug)]
pub struct GpuInfo {
    /// Device number as enumerated by the driver.
    pub dev: i32,
    /// Ranks hosted on this GPU; `ranks[0]` represents the GPU in channel
    /// descriptions until the final multi-rank expansion.
    pub ranks: Vec<i32>,
    /// Compute capability; older parts (< 80) tax the reverse direction of
    /// inbound PCIe traffic.
    pub comp_cap: i32,
    /// One bit per channel under construction; bit `c` set means the GPU is
    /// already part of channel `c` being built.
    pub used: u64,
}

#[derive(Clone, Debug)]
pub struct CpuInfo {
    pub arch: CpuArch,
    pub vendor: CpuVendor,
}

/// A network interface. NICs sharing (asic, port) share physical bandwidth
/// and are debited together.
#[derive(Clone, Debug)]
pub struct NicInfo {
    pub id: i64,
    pub asic: i64,
    pub port: i32,
    /// Remaining per-channel bandwidth of the (asic, port) group.
    pub bw: f32,
    pub latency: f32,
    /// How many more channels may enter through this NIC.
    pub max_channels: i32,
    /// Whether the NIC supports in-network collectives.
    pub coll_support: bool,
    /// Whether the NIC can DMA directly to/from GPU memory.
    pub gdr: bool,
}

/// What a topology node is. Kind-specific data rides in the variant; paths
/// and links refer to nodes by arena index, never by owning pointer.
#[derive(Clone, Debug)]
pub enum NodeClass {
    Gpu(GpuInfo),
    Cpu(CpuInfo),
    Nic(NicInfo),
    PciSwitch,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub class: NodeClass,
}

impl Node {
    pub fn is_gpu(&self) -> bool {
        matches!(self.class, NodeClass::Gpu(_))
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self.class, NodeClass::Cpu(_))
    }

    pub fn is_nic(&self) -> bool {
        matches!(self.class, NodeClass::Nic(_))
    }

    pub fn as_gpu(&self) -> Option<&GpuInfo> {
        match &self.class {
            NodeClass::Gpu(gpu) => Some(gpu),
            _ => None,
        }
    }

    pub fn as_cpu(&self) -> Option<&CpuInfo> {
        match &self.class {
            NodeClass::Cpu(cpu) => Some(cpu),
            _ => None,
        }
    }

    pub fn as_nic(&self) -> Option<&NicInfo> {
        match &self.class {
            NodeClass::Nic(nic) => Some(nic),
            _ => None,
        }
    }
}
