//! Shower detector host (FEDM digitizer board)
//!
//! Pulse reports carry a time reference made of the last sync pulse number
//! and the board's fast PLL cycle count. Per-channel counters accumulate
//! across reports for the life of the session.

use super::{expect_args, parse_field, HostEffect, HostMessageError};
use crate::publisher::{Issue, Publisher};
use crate::types::NodeId;
use crate::watchbox::WatchBox;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CHANNEL_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseformChannel {
    /// 1-based channel number
    pub id: u8,
    pub non_coincident: u64,
    pub fifo_full_events: u64,
    pub coincidence_candidates: u64,
    pub lost: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncRef {
    pub sync_num: u64,
    pub pll_cycle: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Threshold DAC output voltages
    DacLevels([f64; 6]),
    NcPulses {
        time_ref: TimeSyncRef,
        last_pll_cycle: u64,
        counts: [u64; CHANNEL_COUNT],
    },
    FifoFull {
        time_ref: TimeSyncRef,
        channel: u8,
        events: u64,
    },
    ConPulse {
        time_ref: TimeSyncRef,
        channel: u8,
        pulse_num: u64,
        start_pll_cycle: u64,
        edge_count: String,
        /// Nested parenthesized list of PLL cycle deltas, e.g. `(0,(2,2),5)`
        deltas: String,
    },
    LostPulses {
        channel: u8,
        lost: u64,
    },
}

impl DetectorEvent {
    pub fn title(&self) -> &'static str {
        match self {
            DetectorEvent::DacLevels(_) => "DAC_LEVELS",
            DetectorEvent::NcPulses { .. } => "NC_PULSES",
            DetectorEvent::FifoFull { .. } => "FIFO_FULL",
            DetectorEvent::ConPulse { .. } => "CON_PULSE",
            DetectorEvent::LostPulses { .. } => "LOST_PULSES",
        }
    }
}

pub struct ShowerDetectorHost {
    node: NodeId,
    channels: [PulseformChannel; CHANNEL_COUNT],
    dac_levels: Arc<WatchBox<[f64; 6]>>,
    publisher: Arc<Publisher<DetectorEvent>>,
}

impl ShowerDetectorHost {
    pub fn new(node: NodeId) -> Self {
        let mut channels = [PulseformChannel::default(); CHANNEL_COUNT];
        for (i, chan) in channels.iter_mut().enumerate() {
            chan.id = i as u8 + 1;
        }
        Self {
            node,
            channels,
            dac_levels: Arc::new(WatchBox::new()),
            publisher: Arc::new(Publisher::new(format!("detector{}", node))),
        }
    }

    pub fn channels(&self) -> &[PulseformChannel; CHANNEL_COUNT] {
        &self.channels
    }

    pub fn dac_levels(&self) -> &Arc<WatchBox<[f64; 6]>> {
        &self.dac_levels
    }

    pub fn publisher(&self) -> &Arc<Publisher<DetectorEvent>> {
        &self.publisher
    }

    /// Handle a detector-specific message. Returns `None` for other types.
    pub(super) fn handle(&mut self, words: &[String]) -> Result<Option<HostEffect>, HostMessageError> {
        let event = match words[0].as_str() {
            "DAC_LEVELS" => self.on_dac_levels(words)?,
            "NC_PULSES" => self.on_nc_pulses(words)?,
            "FIFO_FULL" => self.on_fifo_full(words)?,
            "CON_PULSE" => self.on_con_pulse(words)?,
            "LOST_PULSES" => self.on_lost_pulses(words)?,
            _ => return Ok(None),
        };
        let issue = Issue::new(event.title(), event);
        Ok(Some(HostEffect::PublishDetector(self.publisher.clone(), issue)))
    }

    fn channel_mut(
        &mut self,
        message: &'static str,
        value: &str,
    ) -> Result<&mut PulseformChannel, HostMessageError> {
        let channel: u64 = parse_field(message, "channel", value)?;
        match channel {
            1..=3 => Ok(&mut self.channels[channel as usize - 1]),
            _ => Err(HostMessageError::BadChannel { message, channel }),
        }
    }

    fn on_dac_levels(&mut self, words: &[String]) -> Result<DetectorEvent, HostMessageError> {
        expect_args(words, "DAC_LEVELS", 6)?;
        let mut levels = [0.0; 6];
        for (level, word) in levels.iter_mut().zip(&words[1..]) {
            *level = parse_field("DAC_LEVELS", "level", word)?;
        }
        info!(
            "Node {} threshold levels are {:?} (volts)",
            self.node, levels
        );
        self.dac_levels.set(levels);
        Ok(DetectorEvent::DacLevels(levels))
    }

    fn on_nc_pulses(&mut self, words: &[String]) -> Result<DetectorEvent, HostMessageError> {
        expect_args(words, "NC_PULSES", 6)?;
        let time_ref = time_ref("NC_PULSES", words)?;
        let last_pll_cycle = parse_field("NC_PULSES", "last PLL cycle", &words[3])?;
        let mut counts = [0u64; CHANNEL_COUNT];
        for (count, word) in counts.iter_mut().zip(&words[4..7]) {
            *count = parse_field("NC_PULSES", "pulse count", word)?;
        }
        for (chan, n) in self.channels.iter_mut().zip(counts) {
            chan.non_coincident = chan.non_coincident.saturating_add(n);
        }
        debug!("Node {} skipped non-coincident pulses {:?}", self.node, counts);
        Ok(DetectorEvent::NcPulses {
            time_ref,
            last_pll_cycle,
            counts,
        })
    }

    fn on_fifo_full(&mut self, words: &[String]) -> Result<DetectorEvent, HostMessageError> {
        expect_args(words, "FIFO_FULL", 4)?;
        let time_ref = time_ref("FIFO_FULL", words)?;
        let events: u64 = parse_field("FIFO_FULL", "event count", &words[4])?;
        let node = self.node;
        let chan = self.channel_mut("FIFO_FULL", &words[3])?;
        chan.fifo_full_events = chan.fifo_full_events.saturating_add(events);
        warn!(
            "Node {} channel {} hardware FIFO filled {} times; pulses may be lost",
            node, chan.id, events
        );
        Ok(DetectorEvent::FifoFull {
            time_ref,
            channel: chan.id,
            events,
        })
    }

    fn on_con_pulse(&mut self, words: &[String]) -> Result<DetectorEvent, HostMessageError> {
        expect_args(words, "CON_PULSE", 7)?;
        let time_ref = time_ref("CON_PULSE", words)?;
        let pulse_num = parse_field("CON_PULSE", "pulse number", &words[4])?;
        let start_pll_cycle = parse_field("CON_PULSE", "start PLL cycle", &words[5])?;
        let chan = self.channel_mut("CON_PULSE", &words[3])?;
        chan.coincidence_candidates = chan.coincidence_candidates.saturating_add(1);
        Ok(DetectorEvent::ConPulse {
            time_ref,
            channel: chan.id,
            pulse_num,
            start_pll_cycle,
            edge_count: words[6].clone(),
            deltas: words[7].clone(),
        })
    }

    fn on_lost_pulses(&mut self, words: &[String]) -> Result<DetectorEvent, HostMessageError> {
        expect_args(words, "LOST_PULSES", 2)?;
        let lost: u64 = parse_field("LOST_PULSES", "lost count", &words[2])?;
        let node = self.node;
        let chan = self.channel_mut("LOST_PULSES", &words[1])?;
        chan.lost = chan.lost.saturating_add(lost);
        warn!(
            "Node {} channel {} dropped {} pulses from a full software buffer",
            node, chan.id, lost
        );
        Ok(DetectorEvent::LostPulses {
            channel: chan.id,
            lost,
        })
    }
}

fn time_ref(message: &'static str, words: &[String]) -> Result<TimeSyncRef, HostMessageError> {
    Ok(TimeSyncRef {
        sync_num: parse_field(message, "sync number", &words[1])?,
        pll_cycle: parse_field(message, "PLL cycle", &words[2])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::parse_host_line;

    fn feed(host: &mut ShowerDetectorHost, line: &str) -> Result<bool, HostMessageError> {
        let words = parse_host_line(line).unwrap().unwrap();
        host.handle(&words).map(|effect| effect.is_some())
    }

    #[test]
    fn test_counters_accumulate() {
        let mut host = ShowerDetectorHost::new(2);
        feed(&mut host, "NC_PULSES,1618,3352941653,3352948689,115,68,203").unwrap();
        feed(&mut host, "NC_PULSES,1619,3352941999,3352948999,5,2,7").unwrap();
        feed(&mut host, "FIFO_FULL,2392,3407048110,3,1").unwrap();
        feed(&mut host, "CON_PULSE,3186,3462552667,3,1,3462608072,2,(0,(2,2),5)").unwrap();
        feed(&mut host, "LOST_PULSES,2,4").unwrap();

        let chans = host.channels();
        assert_eq!(chans[0].non_coincident, 120);
        assert_eq!(chans[1].non_coincident, 70);
        assert_eq!(chans[2].non_coincident, 210);
        assert_eq!(chans[2].fifo_full_events, 1);
        assert_eq!(chans[2].coincidence_candidates, 1);
        assert_eq!(chans[1].lost, 4);
    }

    #[test]
    fn test_dac_levels_recorded() {
        let mut host = ShowerDetectorHost::new(2);
        assert!(feed(&mut host, "DAC_LEVELS,-0.200,-2.500,-0.299,-0.447,-0.669,-1.000").unwrap());
        assert_eq!(
            host.dac_levels().latest(),
            Some([-0.2, -2.5, -0.299, -0.447, -0.669, -1.0])
        );
    }

    #[test]
    fn test_bad_messages_rejected() {
        let mut host = ShowerDetectorHost::new(2);
        assert!(matches!(
            feed(&mut host, "LOST_PULSES,4,1"),
            Err(HostMessageError::BadChannel { channel: 4, .. })
        ));
        assert!(matches!(
            feed(&mut host, "FIFO_FULL,1,2,3"),
            Err(HostMessageError::FieldCount { expected: 4, got: 3, .. })
        ));
        assert!(!feed(&mut host, "HOST_READY").unwrap());
        assert_eq!(host.channels()[0].lost, 0);
    }

    #[test]
    fn test_counters_saturate_on_huge_reports() {
        let mut host = ShowerDetectorHost::new(2);
        feed(&mut host, "NC_PULSES,1,2,3,18446744073709551615,0,0").unwrap();
        feed(&mut host, "NC_PULSES,1,2,3,1,0,0").unwrap();
        feed(&mut host, "LOST_PULSES,1,18446744073709551615").unwrap();
        feed(&mut host, "LOST_PULSES,1,9").unwrap();
        feed(&mut host, "FIFO_FULL,1,2,1,18446744073709551615").unwrap();
        feed(&mut host, "FIFO_FULL,1,2,1,1").unwrap();
        let chan = host.channels()[0];
        assert_eq!(chan.non_coincident, u64::MAX);
        assert_eq!(chan.lost, u64::MAX);
        assert_eq!(chan.fifo_full_events, u64::MAX);
    }

    #[test]
    fn test_publication_is_left_to_the_caller() {
        let mut host = ShowerDetectorHost::new(2);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        host.publisher().subscribe_all("test", move |issue: &Issue<DetectorEvent>| {
            s.lock().push(issue.title.clone())
        });
        let words = parse_host_line("LOST_PULSES,2,4").unwrap().unwrap();
        let effect = host.handle(&words).unwrap();
        assert!(seen.lock().is_empty());
        match effect {
            Some(HostEffect::PublishDetector(publisher, issue)) => {
                publisher.publish(issue);
            }
            _ => panic!("expected a detector publication"),
        }
        assert_eq!(*seen.lock(), vec!["LOST_PULSES".to_string()]);
    }
}
