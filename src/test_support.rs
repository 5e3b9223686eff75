// src/test_support.rs
//! Builders shared by the unit tests.

use crate::config::Config;
use crate::model::{
    CrtcTiming, LinkId, LinkInfo, Plane, PlaneId, PlaneProps, Stream, StreamConfig, StreamId,
    VrrRange,
};
use crate::resource::ResourcePool;
use std::sync::Arc;

pub fn pool() -> ResourcePool {
    ResourcePool::from_config(&Config::default())
}

pub fn stream_config(id: u32) -> StreamConfig {
    StreamConfig::new(CrtcTiming::fhd_60(), LinkInfo::hbr3(LinkId(id)))
}

pub fn stream(id: u32) -> Arc<Stream> {
    Arc::new(Stream::new(StreamId(id), stream_config(id)))
}

/// 1440p144 stream with a 48-144 Hz variable refresh range.
pub fn vrr_stream(id: u32) -> Arc<Stream> {
    let config = StreamConfig::new(CrtcTiming::qhd_144(), LinkInfo::hbr3(LinkId(id))).with_vrr(
        VrrRange {
            min_refresh_mhz: 48_000,
            max_refresh_mhz: 144_000,
        },
    );
    Arc::new(Stream::new(StreamId(id), config))
}

pub fn plane(id: u32) -> Arc<Plane> {
    Arc::new(Plane::new(
        PlaneId(id),
        PlaneProps::simple(1920, 1080),
        0x1000_0000 + id as u64 * 0x100_0000,
    ))
}
