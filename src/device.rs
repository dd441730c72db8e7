//! Channel routing and front-end configuration

use std::collections::HashSet;

use tracing::{debug, info};

use crate::{plan::ChannelConfig, radio::Radio, Error, Result};

pub const MAX_CHANNELS: usize = 8;

/// Where one logical channel enters the hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub board: usize,
    /// Daughterboard slot in subdevice-spec notation, e.g. `A:1`
    pub slot: &'static str,
    pub antenna: &'static str,
}

const fn route(board: usize, slot: &'static str, antenna: &'static str) -> Route {
    Route {
        board,
        slot,
        antenna,
    }
}

// Board 0 fills first, then board 1 in the same port order
const ROUTES: [&[Route]; MAX_CHANNELS] = [
    &[route(0, "A:0", "RX1")],
    &[route(0, "A:0", "RX1"), route(0, "A:1", "RX2")],
    &[
        route(0, "A:0", "RX1"),
        route(0, "A:1", "RX2"),
        route(0, "B:0", "RX1"),
    ],
    &[
        route(0, "A:0", "RX1"),
        route(0, "A:1", "RX2"),
        route(0, "B:0", "RX1"),
        route(0, "B:1", "RX2"),
    ],
    &[
        route(0, "A:0", "RX1"),
        route(0, "A:1", "RX2"),
        route(0, "B:0", "RX1"),
        route(0, "B:1", "RX2"),
        route(1, "A:0", "RX1"),
    ],
    &[
        route(0, "A:0", "RX1"),
        route(0, "A:1", "RX2"),
        route(0, "B:0", "RX1"),
        route(0, "B:1", "RX2"),
        route(1, "A:0", "RX1"),
        route(1, "A:1", "RX2"),
    ],
    &[
        route(0, "A:0", "RX1"),
        route(0, "A:1", "RX2"),
        route(0, "B:0", "RX1"),
        route(0, "B:1", "RX2"),
        route(1, "A:0", "RX1"),
        route(1, "A:1", "RX2"),
        route(1, "B:0", "RX1"),
    ],
    &[
        route(0, "A:0", "RX1"),
        route(0, "A:1", "RX2"),
        route(0, "B:0", "RX1"),
        route(0, "B:1", "RX2"),
        route(1, "A:0", "RX1"),
        route(1, "A:1", "RX2"),
        route(1, "B:0", "RX1"),
        route(1, "B:1", "RX2"),
    ],
];

/// Channel count to ordered routes, checked once when the table is built
#[derive(Clone, Debug)]
pub struct RoutingTable {
    entries: Vec<Vec<Route>>,
}

impl RoutingTable {
    /// `entries[n - 1]` holds the routes used for `n` channels
    pub fn new(entries: Vec<Vec<Route>>) -> Result<Self> {
        for (i, routes) in entries.iter().enumerate() {
            let n = i + 1;
            if routes.len() != n {
                return Err(Error::Configuration(format!(
                    "routing entry for {n} channel(s) lists {} route(s)",
                    routes.len()
                )));
            }
            let mut slots = HashSet::new();
            let mut ports = HashSet::new();
            for r in routes {
                if !slots.insert((r.board, r.slot)) {
                    return Err(Error::Configuration(format!(
                        "routing entry for {n} channel(s) uses board {} slot {} twice",
                        r.board, r.slot
                    )));
                }
                let dboard = r.slot.split(':').next().unwrap_or(r.slot);
                if !ports.insert((r.board, dboard, r.antenna)) {
                    return Err(Error::Configuration(format!(
                        "routing entry for {n} channel(s) uses antenna {} on board {} daughterboard {} twice",
                        r.antenna, r.board, dboard
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(ROUTES.iter().map(|routes| routes.to_vec()).collect())
    }

    pub fn routes(&self, channels: usize) -> Result<&[Route]> {
        if channels == 0 {
            return Err(Error::UnsupportedChannelCount(channels));
        }
        self.entries
            .get(channels - 1)
            .map(Vec::as_slice)
            .ok_or(Error::UnsupportedChannelCount(channels))
    }

    /// Boards that must be present to route `channels`
    pub fn boards_needed(&self, channels: usize) -> Result<usize> {
        Ok(self
            .routes(channels)?
            .iter()
            .map(|r| r.board + 1)
            .max()
            .unwrap_or(1))
    }
}

/// Subdevice spec strings per board, e.g. `(0, "A:0 A:1")`
pub fn subdev_specs(routes: &[Route]) -> Vec<(usize, String)> {
    let mut specs: Vec<(usize, Vec<&str>)> = Vec::new();
    for r in routes {
        match specs.iter_mut().find(|(board, _)| *board == r.board) {
            Some((_, slots)) => slots.push(r.slot),
            None => specs.push((r.board, vec![r.slot])),
        }
    }
    specs
        .into_iter()
        .map(|(board, slots)| (board, slots.join(" ")))
        .collect()
}

/// What the hardware actually settled on after quantization
#[derive(Clone, Debug, PartialEq)]
pub struct Achieved {
    pub antenna: String,
    pub freq: f64,
    pub rate: f64,
    pub bandwidth: f64,
    pub gain: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReadback {
    pub requested: ChannelConfig,
    pub achieved: Achieved,
}

pub struct DeviceController {
    routes: Vec<Route>,
}

impl DeviceController {
    /// Look up the routes for `channels` and check the radio has the boards they need
    pub fn new(table: &RoutingTable, channels: usize, boards: usize) -> Result<Self> {
        let needed = table.boards_needed(channels)?;
        if needed > boards {
            return Err(Error::IncompatibleDevice {
                channels,
                needed,
                boards,
            });
        }
        Ok(Self {
            routes: table.routes(channels)?.to_vec(),
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn num_channels(&self) -> usize {
        self.routes.len()
    }

    pub fn apply_routing<R: Radio + ?Sized>(&self, radio: &mut R) -> Result<()> {
        for (board, spec) in subdev_specs(&self.routes) {
            debug!(board, spec = spec.as_str(), "Setting RX subdevice spec");
            radio.set_rx_subdev_spec(&spec, board)?;
        }
        for (chan, r) in self.routes.iter().enumerate() {
            radio.set_rx_antenna(r.antenna, chan)?;
        }
        Ok(())
    }

    /// Push frequency, rate, bandwidth and gain to every channel and read back what stuck
    pub fn configure<R: Radio + ?Sized>(
        &self,
        radio: &mut R,
        channels: &[ChannelConfig],
    ) -> Result<Vec<ChannelReadback>> {
        if channels.len() != self.routes.len() {
            return Err(Error::Configuration(format!(
                "{} channel configs for {} routed channels",
                channels.len(),
                self.routes.len()
            )));
        }
        for c in channels {
            radio.set_rx_freq(c.freq, c.index)?;
            info!(
                "Ch {} RX Freq: {:.6} MHz (actual {:.6} MHz)",
                c.index,
                c.freq / 1e6,
                radio.rx_freq(c.index)? / 1e6
            );
        }
        for c in channels {
            radio.set_rx_rate(c.rate, c.index)?;
            info!(
                "Ch {} RX Rate: {:.6} Msps (actual {:.6} Msps)",
                c.index,
                c.rate / 1e6,
                radio.rx_rate(c.index)? / 1e6
            );
        }
        for c in channels {
            radio.set_rx_bandwidth(c.bandwidth, c.index)?;
            info!(
                "Ch {} RX Bandwidth: {:.6} MHz (actual {:.6} MHz)",
                c.index,
                c.bandwidth / 1e6,
                radio.rx_bandwidth(c.index)? / 1e6
            );
        }
        for c in channels {
            radio.set_rx_gain(c.gain, c.index)?;
            info!(
                "Ch {} RX Gain: {:.6} dB (actual {:.6} dB)",
                c.index,
                c.gain,
                radio.rx_gain(c.index)?
            );
        }
        self.readback(radio, channels)
    }

    pub fn readback<R: Radio + ?Sized>(
        &self,
        radio: &R,
        channels: &[ChannelConfig],
    ) -> Result<Vec<ChannelReadback>> {
        channels
            .iter()
            .map(|c| {
                Ok(ChannelReadback {
                    requested: c.clone(),
                    achieved: Achieved {
                        antenna: radio.rx_antenna(c.index)?,
                        freq: radio.rx_freq(c.index)?,
                        rate: radio.rx_rate(c.index)?,
                        bandwidth: radio.rx_bandwidth(c.index)?,
                        gain: radio.rx_gain(c.index)?,
                    },
                })
            })
            .collect()
    }

    /// Apply one gain to every routed channel, returning the achieved gains
    pub fn set_gain<R: Radio + ?Sized>(&self, radio: &mut R, gain: f64) -> Result<Vec<f64>> {
        let mut achieved = Vec::with_capacity(self.routes.len());
        for chan in 0..self.routes.len() {
            radio.set_rx_gain(gain, chan)?;
            achieved.push(radio.rx_gain(chan)?);
        }
        Ok(achieved)
    }
}
