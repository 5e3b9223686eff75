// src/resource/mod.rs
//! Resource Context: the pipe arena of one state container.
//!
//! Pipes live in a fixed-capacity array. Sibling links (`top`/`bottom` for
//! the blending chain, `prev_odm`/`next_odm` for horizontal combine) are
//! indices into that array, so copying a context is a flat clone and every
//! link stays valid in the copy.
//!
//! ## Layout
//! A stream owns one or more ODM segments. Each segment head carries the
//! stream's first plane; further planes hang below it through `bottom_pipe`.
//! The stream head (first segment) owns the timing generator and link
//! encoder; every pipe with a plane owns a scaler and a compositor.

use crate::config::Config;
use crate::error::{HwBlock, ResourceError};
use crate::model::{CrtcTiming, FlipAddress, Plane, PlaneId, PlaneProps, Stream, StreamId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Largest pipe count any supported hardware exposes.
pub const MAX_PIPES: usize = 6;

// --- Resource Pool ---

/// Counts of the hardware blocks pipes may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePool {
    pub pipe_count: usize,
    pub timing_generators: u8,
    pub scalers: u8,
    pub compositors: u8,
    pub link_encoders: u8,
    /// Highest display clock; streams above it need a horizontal split.
    pub max_dispclk_khz: u32,
}

impl ResourcePool {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipe_count: config.pool.pipe_count.min(MAX_PIPES),
            timing_generators: config.pool.timing_generators,
            scalers: config.pool.scalers,
            compositors: config.pool.compositors,
            link_encoders: config.pool.link_encoders,
            max_dispclk_khz: config.bandwidth.max_dispclk_khz(),
        }
    }

    pub fn capacity(&self, block: HwBlock) -> u8 {
        match block {
            HwBlock::TimingGenerator => self.timing_generators,
            HwBlock::Scaler => self.scalers,
            HwBlock::Compositor => self.compositors,
            HwBlock::LinkEncoder => self.link_encoders,
        }
    }

    /// Number of horizontally combined pipes a timing needs.
    pub fn odm_segments(&self, timing: &CrtcTiming) -> usize {
        if self.max_dispclk_khz > 0 && timing.pix_clk_khz() > self.max_dispclk_khz as u64 {
            2
        } else {
            1
        }
    }
}

// --- Pipes ---

/// Hardware block instances a pipe is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HwBlocks {
    pub tg: Option<u8>,
    pub scaler: Option<u8>,
    pub compositor: Option<u8>,
    pub link_enc: Option<u8>,
}

impl HwBlocks {
    pub fn get(&self, block: HwBlock) -> Option<u8> {
        match block {
            HwBlock::TimingGenerator => self.tg,
            HwBlock::Scaler => self.scaler,
            HwBlock::Compositor => self.compositor,
            HwBlock::LinkEncoder => self.link_enc,
        }
    }

    fn is_empty(&self) -> bool {
        *self == HwBlocks::default()
    }
}

const ALL_BLOCKS: [HwBlock; 4] = [
    HwBlock::TimingGenerator,
    HwBlock::Scaler,
    HwBlock::Compositor,
    HwBlock::LinkEncoder,
];

#[derive(Debug, Clone, Default)]
pub struct PipeCtx {
    pub stream: Option<Arc<Stream>>,
    pub plane: Option<Arc<Plane>>,
    pub top_pipe: Option<usize>,
    pub bottom_pipe: Option<usize>,
    pub prev_odm_pipe: Option<usize>,
    pub next_odm_pipe: Option<usize>,
    pub hw: HwBlocks,
}

impl PipeCtx {
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream.as_ref().map(|s| s.id())
    }

    pub fn plane_id(&self) -> Option<PlaneId> {
        self.plane.as_ref().map(|p| p.id())
    }

    pub fn is_idle(&self) -> bool {
        self.stream.is_none()
    }

    fn has_links(&self) -> bool {
        self.top_pipe.is_some()
            || self.bottom_pipe.is_some()
            || self.prev_odm_pipe.is_some()
            || self.next_odm_pipe.is_some()
    }
}

/// Comparable snapshot of one pipe, including object identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeFingerprint {
    pub stream: Option<(StreamId, usize)>,
    pub plane: Option<(PlaneId, usize, PlaneProps, FlipAddress)>,
    pub links: [Option<usize>; 4],
    pub hw: HwBlocks,
}

// --- Resource Context ---

#[derive(Debug, Clone)]
pub struct ResourceContext {
    pipes: [PipeCtx; MAX_PIPES],
    pipe_count: usize,
}

impl ResourceContext {
    pub fn new(pipe_count: usize) -> Self {
        Self {
            pipes: std::array::from_fn(|_| PipeCtx::default()),
            pipe_count: pipe_count.min(MAX_PIPES),
        }
    }

    pub fn pipe_count(&self) -> usize {
        self.pipe_count
    }

    pub fn pipe(&self, idx: usize) -> Option<&PipeCtx> {
        self.pipes[..self.pipe_count].get(idx)
    }

    pub(crate) fn pipe_mut(&mut self, idx: usize) -> Option<&mut PipeCtx> {
        self.pipes[..self.pipe_count].get_mut(idx)
    }

    pub fn pipes(&self) -> impl Iterator<Item = (usize, &PipeCtx)> {
        self.pipes[..self.pipe_count].iter().enumerate()
    }

    /// Pipe owning the stream's timing generator.
    pub fn head_pipe(&self, stream: StreamId) -> Option<usize> {
        self.pipes().find_map(|(i, p)| {
            (p.stream_id() == Some(stream) && p.top_pipe.is_none() && p.prev_odm_pipe.is_none())
                .then_some(i)
        })
    }

    /// Heads of every ODM segment of a stream, left to right.
    pub fn segment_heads(&self, stream: StreamId) -> Vec<usize> {
        let mut heads = Vec::new();
        let mut next = self.head_pipe(stream);
        while let Some(idx) = next {
            if heads.contains(&idx) {
                break;
            }
            heads.push(idx);
            next = self.pipes[idx].next_odm_pipe;
        }
        heads
    }

    /// All pipes of a stream in programming order: segment by segment,
    /// top of each blending chain first.
    pub fn stream_pipes(&self, stream: StreamId) -> Vec<usize> {
        let mut out = Vec::new();
        for head in self.segment_heads(stream) {
            let mut next = Some(head);
            while let Some(idx) = next {
                if out.contains(&idx) {
                    break;
                }
                out.push(idx);
                next = self.pipes[idx].bottom_pipe;
            }
        }
        out
    }

    pub fn pipes_with_plane(&self, plane: PlaneId) -> Vec<usize> {
        self.pipes()
            .filter(|(_, p)| p.plane_id() == Some(plane))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn contains_plane(&self, plane: PlaneId) -> bool {
        self.pipes().any(|(_, p)| p.plane_id() == Some(plane))
    }

    pub fn fingerprint(&self) -> Vec<PipeFingerprint> {
        self.pipes()
            .map(|(_, p)| PipeFingerprint {
                stream: p
                    .stream
                    .as_ref()
                    .map(|s| (s.id(), Arc::as_ptr(s) as usize)),
                plane: p.plane.as_ref().map(|pl| {
                    (
                        pl.id(),
                        Arc::as_ptr(pl) as usize,
                        *pl.props(),
                        pl.address(),
                    )
                }),
                links: [p.top_pipe, p.bottom_pipe, p.prev_odm_pipe, p.next_odm_pipe],
                hw: p.hw,
            })
            .collect()
    }

    fn free_pipes(&self) -> Vec<usize> {
        self.pipes()
            .filter(|(_, p)| p.is_idle())
            .map(|(i, _)| i)
            .collect()
    }

    fn free_blocks(&self, pool: &ResourcePool, block: HwBlock) -> Vec<u8> {
        let used: HashSet<u8> = self.pipes().filter_map(|(_, p)| p.hw.get(block)).collect();
        (0..pool.capacity(block))
            .filter(|i| !used.contains(i))
            .collect()
    }

    fn chain_tail(&self, head: usize) -> usize {
        let mut idx = head;
        let mut steps = 0;
        while let Some(next) = self.pipes[idx].bottom_pipe {
            idx = next;
            steps += 1;
            if steps > self.pipe_count {
                break;
            }
        }
        idx
    }

    // --- Mutation ---
    //
    // Every mutating operation checks availability first and only then
    // touches the array, so an error leaves the context untouched.

    pub(crate) fn add_stream(
        &mut self,
        stream: &Arc<Stream>,
        pool: &ResourcePool,
    ) -> Result<(), ResourceError> {
        if self.head_pipe(stream.id()).is_some() {
            return Err(ResourceError::DuplicateStream(stream.id()));
        }
        let segments = pool.odm_segments(stream.timing());
        let pipes: Vec<usize> = self.free_pipes().into_iter().take(segments).collect();
        if pipes.len() < segments {
            return Err(ResourceError::NoFreePipe);
        }
        let tg = self
            .free_blocks(pool, HwBlock::TimingGenerator)
            .first()
            .copied()
            .ok_or(ResourceError::NoFreeBlock(HwBlock::TimingGenerator))?;
        let link_enc = self
            .free_blocks(pool, HwBlock::LinkEncoder)
            .first()
            .copied()
            .ok_or(ResourceError::NoFreeBlock(HwBlock::LinkEncoder))?;

        for (i, &idx) in pipes.iter().enumerate() {
            let pipe = &mut self.pipes[idx];
            pipe.stream = Some(Arc::clone(stream));
            pipe.prev_odm_pipe = i.checked_sub(1).map(|prev| pipes[prev]);
            pipe.next_odm_pipe = pipes.get(i + 1).copied();
        }
        self.pipes[pipes[0]].hw.tg = Some(tg);
        self.pipes[pipes[0]].hw.link_enc = Some(link_enc);
        Ok(())
    }

    pub(crate) fn remove_stream(&mut self, stream: StreamId) {
        for pipe in self.pipes[..self.pipe_count].iter_mut() {
            if pipe.stream_id() == Some(stream) {
                *pipe = PipeCtx::default();
            }
        }
    }

    /// Binds `plane` to every ODM segment of `stream`, below any planes it
    /// already carries.
    pub(crate) fn add_plane(
        &mut self,
        stream: StreamId,
        plane: &Arc<Plane>,
        pool: &ResourcePool,
    ) -> Result<(), ResourceError> {
        let heads = self.segment_heads(stream);
        if heads.is_empty() {
            return Err(ResourceError::UnknownStream(stream));
        }
        if self
            .stream_pipes(stream)
            .iter()
            .any(|&i| self.pipes[i].plane_id() == Some(plane.id()))
        {
            return Err(ResourceError::DuplicatePlane {
                stream,
                plane: plane.id(),
            });
        }

        let tails: Vec<usize> = heads.iter().map(|&h| self.chain_tail(h)).collect();
        let needed_pipes = tails
            .iter()
            .filter(|&&t| self.pipes[t].plane.is_some())
            .count();
        let mut free_pipes = self.free_pipes().into_iter();
        if free_pipes.len() < needed_pipes {
            return Err(ResourceError::NoFreePipe);
        }
        let mut scalers = self.free_blocks(pool, HwBlock::Scaler).into_iter();
        let mut compositors = self.free_blocks(pool, HwBlock::Compositor).into_iter();
        if scalers.len() < heads.len() {
            return Err(ResourceError::NoFreeBlock(HwBlock::Scaler));
        }
        if compositors.len() < heads.len() {
            return Err(ResourceError::NoFreeBlock(HwBlock::Compositor));
        }

        for tail in tails {
            let target = if self.pipes[tail].plane.is_none() {
                tail
            } else {
                let idx = free_pipes.next().ok_or(ResourceError::NoFreePipe)?;
                self.pipes[idx].stream = self.pipes[tail].stream.clone();
                self.pipes[idx].top_pipe = Some(tail);
                self.pipes[tail].bottom_pipe = Some(idx);
                idx
            };
            let pipe = &mut self.pipes[target];
            pipe.plane = Some(Arc::clone(plane));
            pipe.hw.scaler = scalers.next();
            pipe.hw.compositor = compositors.next();
        }
        Ok(())
    }

    /// Unbinds every plane of `stream`, releasing secondary blending pipes.
    pub(crate) fn strip_planes(&mut self, stream: StreamId) {
        for pipe in self.pipes[..self.pipe_count].iter_mut() {
            if pipe.stream_id() != Some(stream) {
                continue;
            }
            if pipe.top_pipe.is_some() {
                *pipe = PipeCtx::default();
            } else {
                pipe.plane = None;
                pipe.bottom_pipe = None;
                pipe.hw.scaler = None;
                pipe.hw.compositor = None;
            }
        }
    }

    pub(crate) fn replace_stream(&mut self, stream: &Arc<Stream>) {
        for pipe in self.pipes[..self.pipe_count].iter_mut() {
            if pipe.stream_id() == Some(stream.id()) {
                pipe.stream = Some(Arc::clone(stream));
            }
        }
    }

    pub(crate) fn replace_plane(&mut self, plane: &Arc<Plane>) {
        for pipe in self.pipes[..self.pipe_count].iter_mut() {
            if pipe.plane_id() == Some(plane.id()) {
                pipe.plane = Some(Arc::clone(plane));
            }
        }
    }

    // --- Verification ---

    /// Checks link consistency, per-stream connectivity and hardware block
    /// bookings against `pool`.
    pub fn verify(&self, pool: &ResourcePool) -> Result<(), ResourceError> {
        self.verify_links()?;
        self.verify_blocks(pool)
    }

    /// Structural invariants of the pipe graph.
    pub fn verify_links(&self) -> Result<(), ResourceError> {
        let broken = |pipe, reason| Err(ResourceError::BrokenChain { pipe, reason });

        for (i, pipe) in self.pipes() {
            let Some(stream) = pipe.stream_id() else {
                if pipe.plane.is_some() || pipe.has_links() || !pipe.hw.is_empty() {
                    return broken(i, "idle pipe holds bindings");
                }
                continue;
            };
            let links: [(Option<usize>, fn(&PipeCtx) -> Option<usize>); 4] = [
                (pipe.top_pipe, |o| o.bottom_pipe),
                (pipe.bottom_pipe, |o| o.top_pipe),
                (pipe.prev_odm_pipe, |o| o.next_odm_pipe),
                (pipe.next_odm_pipe, |o| o.prev_odm_pipe),
            ];
            for (link, back_link) in links {
                let Some(j) = link else { continue };
                let Some(other) = self.pipe(j) else {
                    return broken(i, "link out of range");
                };
                if other.stream_id() != Some(stream) {
                    return broken(i, "link crosses streams");
                }
                if back_link(other) != Some(i) {
                    return broken(i, "link is not reciprocal");
                }
            }
            if pipe.top_pipe.is_some() && pipe.plane.is_none() {
                return broken(i, "blending pipe without plane");
            }
            if pipe.top_pipe.is_some()
                && (pipe.prev_odm_pipe.is_some() || pipe.next_odm_pipe.is_some())
            {
                return broken(i, "blending pipe is also an ODM segment");
            }
        }

        let mut by_stream: HashMap<StreamId, Vec<usize>> = HashMap::new();
        for (i, pipe) in self.pipes() {
            if let Some(id) = pipe.stream_id() {
                by_stream.entry(id).or_default().push(i);
            }
        }
        for (stream, members) in by_stream {
            let heads: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| {
                    self.pipes[i].top_pipe.is_none() && self.pipes[i].prev_odm_pipe.is_none()
                })
                .collect();
            if heads.len() != 1 {
                return broken(members[0], "stream does not have exactly one head pipe");
            }
            let reached = self.stream_pipes(stream);
            if reached.len() != members.len() {
                let stray = members
                    .iter()
                    .copied()
                    .find(|i| !reached.contains(i))
                    .unwrap_or(members[0]);
                return broken(stray, "pipe is disconnected from its stream chain");
            }
        }
        Ok(())
    }

    fn verify_blocks(&self, pool: &ResourcePool) -> Result<(), ResourceError> {
        for block in ALL_BLOCKS {
            let mut owners: HashMap<u8, usize> = HashMap::new();
            for (i, pipe) in self.pipes() {
                let Some(index) = pipe.hw.get(block) else {
                    continue;
                };
                if index >= pool.capacity(block) {
                    return Err(ResourceError::BlockOutOfRange {
                        block,
                        index,
                        available: pool.capacity(block),
                    });
                }
                if let Some(&first) = owners.get(&index) {
                    return Err(ResourceError::DoubleBooked {
                        block,
                        index,
                        first,
                        second: i,
                    });
                }
                owners.insert(index, i);
            }
        }

        for (_, pipe) in self.pipes() {
            let Some(stream) = pipe.stream_id() else {
                continue;
            };
            let is_head = pipe.top_pipe.is_none() && pipe.prev_odm_pipe.is_none();
            if is_head && pipe.hw.tg.is_none() {
                return Err(ResourceError::MissingBlock {
                    stream,
                    block: HwBlock::TimingGenerator,
                });
            }
            if is_head && pipe.hw.link_enc.is_none() {
                return Err(ResourceError::MissingBlock {
                    stream,
                    block: HwBlock::LinkEncoder,
                });
            }
            if pipe.plane.is_some() {
                for block in [HwBlock::Scaler, HwBlock::Compositor] {
                    if pipe.hw.get(block).is_none() {
                        return Err(ResourceError::MissingBlock { stream, block });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
