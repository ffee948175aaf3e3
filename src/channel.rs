//! Channel plan and channel hopping
//!
//! This module converts between channel numbers and frequencies and drives
//! periodic hopping of a capture interface through a channel list. Hopping
//! is a self re-arming event loop timer; the pending timer id is kept so
//! hopping can be switched off at any time.

use serde::{Deserialize, Serialize};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::daemon::event::{EventLoop, TimerId};
use crate::{Result, SnifferError};

/// Default hop interval
pub const DEFAULT_HOP_INTERVAL: Duration = Duration::from_secs(1);

/// Frequency band of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Band24,
    Band5,
}

/// Convert channel number to frequency in MHz
pub fn channel_to_frequency(channel: u8) -> Option<u16> {
    match channel {
        1..=13 => Some(2407 + channel as u16 * 5),
        14 => Some(2484),
        36..=165 => Some(5000 + channel as u16 * 5),
        _ => None,
    }
}

/// Convert frequency in MHz to channel number
pub fn frequency_to_channel(freq: u16) -> Option<u8> {
    match freq {
        2412..=2472 if (freq - 2407) % 5 == 0 => Some(((freq - 2407) / 5) as u8),
        2484 => Some(14),
        5180..=5825 if freq % 5 == 0 => Some(((freq - 5000) / 5) as u8),
        _ => None,
    }
}

pub fn band_of(channel: u8) -> Option<Band> {
    match channel {
        1..=14 => Some(Band::Band24),
        36..=165 => Some(Band::Band5),
        _ => None,
    }
}

pub fn is_valid_channel(channel: u8) -> bool {
    channel_to_frequency(channel).is_some()
}

/// Something that can retune a capture interface
pub trait ChannelSwitcher {
    fn switch(&mut self, channel: u8) -> Result<()>;
}

/// Retunes interfaces by running `iw dev <if> set channel <n>` for each.
///
/// The command is not waited for; finished children are reaped on the next
/// switch.
#[derive(Debug)]
pub struct IwSwitcher {
    ifnames: Vec<String>,
    children: Vec<Child>,
}

impl IwSwitcher {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self::for_interfaces(vec![ifname.into()])
    }

    /// Retune several interfaces together
    pub fn for_interfaces(ifnames: Vec<String>) -> Self {
        Self {
            ifnames,
            children: Vec::new(),
        }
    }

    pub fn interfaces(&self) -> &[String] {
        &self.ifnames
    }

    fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    log::warn!("iw exited with {}", status);
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("Failed to poll iw child: {}", e);
                false
            }
        });
    }
}

impl ChannelSwitcher for IwSwitcher {
    fn switch(&mut self, channel: u8) -> Result<()> {
        self.reap();

        let channel = channel.to_string();
        for ifname in &self.ifnames {
            let child = Command::new("iw")
                .args(["dev", ifname.as_str(), "set", "channel", channel.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| SnifferError::System(format!("Failed to run iw for {}: {}", ifname, e)))?;
            self.children.push(child);
        }
        Ok(())
    }
}

impl Drop for IwSwitcher {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.wait();
        }
    }
}

/// Walks a channel list, tuning the interface at each step
pub struct ChannelHopper {
    channels: Vec<u8>,
    index: usize,
    interval: Duration,
    switcher: Box<dyn ChannelSwitcher>,
    timer: Option<TimerId>,
    hops: u64,
}

impl std::fmt::Debug for ChannelHopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHopper")
            .field("channels", &self.channels)
            .field("index", &self.index)
            .field("interval", &self.interval)
            .field("active", &self.timer.is_some())
            .field("hops", &self.hops)
            .finish()
    }
}

impl ChannelHopper {
    pub fn new(channels: Vec<u8>, interval: Duration, switcher: Box<dyn ChannelSwitcher>) -> Result<Self> {
        if channels.is_empty() {
            return Err(SnifferError::InvalidParameter("empty channel list".to_string()));
        }
        if let Some(bad) = channels.iter().find(|c| !is_valid_channel(**c)) {
            return Err(SnifferError::InvalidParameter(format!("invalid channel {}", bad)));
        }
        if interval.is_zero() {
            return Err(SnifferError::InvalidParameter("zero hop interval".to_string()));
        }

        Ok(Self {
            channels,
            index: 0,
            interval,
            switcher,
            timer: None,
            hops: 0,
        })
    }

    pub fn current(&self) -> u8 {
        self.channels[self.index]
    }

    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn hops(&self) -> u64 {
        self.hops
    }

    /// Whether a hop timer is pending
    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Move to the next channel and retune
    pub fn hop(&mut self) -> Result<u8> {
        self.index = (self.index + 1) % self.channels.len();
        let channel = self.current();
        self.switcher.switch(channel)?;
        self.hops += 1;
        log::debug!("Hopped to channel {}", channel);
        Ok(channel)
    }
}

/// Application context owning a channel hopper
pub trait HopperHost {
    fn hopper(&mut self) -> Option<&mut ChannelHopper>;
}

/// Start periodic hopping. Returns false if already hopping or there is no
/// hopper.
pub fn start_hopping<S: HopperHost + 'static>(ev: &mut EventLoop<S>, state: &mut S) -> bool {
    let Some(hopper) = state.hopper() else {
        return false;
    };
    if hopper.timer.is_some() {
        return false;
    }

    hopper.timer = Some(ev.register_timeout(hopper.interval, on_hop_timer::<S>));
    log::info!("Channel hopping started every {:?} over {:?}", hopper.interval, hopper.channels);
    true
}

/// Stop periodic hopping. Returns false if it was not running.
pub fn stop_hopping<S>(ev: &mut EventLoop<S>, state: &mut S) -> bool
where
    S: HopperHost,
{
    let Some(id) = state.hopper().and_then(|h| h.timer.take()) else {
        return false;
    };
    ev.cancel_timeout(id);
    log::info!("Channel hopping stopped");
    true
}

fn on_hop_timer<S: HopperHost + 'static>(ev: &mut EventLoop<S>, state: &mut S) {
    let Some(hopper) = state.hopper() else {
        return;
    };

    if let Err(e) = hopper.hop() {
        log::warn!("Channel hop failed: {}", e);
    }
    hopper.timer = Some(ev.register_timeout(hopper.interval, on_hop_timer::<S>));
}
