//! Central timing unit host

use super::{expect_args, parse_field, HostEffect, HostMessageError};
use crate::gps::{GpsManager, GpsModule};
use crate::publisher::{Issue, Publisher};
use crate::types::NodeId;
use crate::watchbox::WatchBox;
use std::sync::Arc;
use tracing::info;

/// A PPS edge as timestamped by the CTU's fast counter (`PPSCNTR`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsCount {
    pub pps_num: u64,
    pub fast_count: u64,
}

pub struct CtuHost {
    gps: Arc<GpsModule>,
    manager: Arc<GpsManager>,
    pps: Arc<WatchBox<PpsCount>>,
    publisher: Arc<Publisher<PpsCount>>,
}

impl CtuHost {
    pub fn new(node: NodeId, gps: Arc<GpsModule>, manager: GpsManager) -> Self {
        Self {
            gps,
            manager: Arc::new(manager),
            pps: Arc::new(WatchBox::new()),
            publisher: Arc::new(Publisher::new(format!("ctu{}", node))),
        }
    }

    pub fn gps(&self) -> &Arc<GpsModule> {
        &self.gps
    }

    pub fn manager(&self) -> &Arc<GpsManager> {
        &self.manager
    }

    pub fn pps(&self) -> &Arc<WatchBox<PpsCount>> {
        &self.pps
    }

    pub fn publisher(&self) -> &Arc<Publisher<PpsCount>> {
        &self.publisher
    }

    pub(super) fn on_ppscntr(&self, words: &[String]) -> Result<HostEffect, HostMessageError> {
        expect_args(words, "PPSCNTR", 2)?;
        let rec = PpsCount {
            pps_num: parse_field("PPSCNTR", "PPS number", &words[1])?,
            fast_count: parse_field("PPSCNTR", "fast count", &words[2])?,
        };
        info!(
            "CTU received PPS rising edge #{} from GPS at time-counter value {}",
            rec.pps_num, rec.fast_count
        );
        self.pps.set(rec);
        Ok(HostEffect::PublishPps(
            self.publisher.clone(),
            Issue::new("PPSCNTR", rec),
        ))
    }
}
