//! Synchronous AT command/response exchanges used at bring-up and for diagnostics.

use log::{debug, info, warn};
use tokio::time::Duration;

use super::RadioChannel;
use crate::config::RadioConfig;
use crate::error::{Error, Result};

/// Modem reply prefix for a rejected command.
const ERR_PREFIX: &str = "ERR=";

/// Read-only queries issued by [`ModemConfigurator::query_info`], in order.
pub const DIAGNOSTIC_QUERIES: [&str; 7] = [
    "AT+VER?",
    "AT+UID?",
    "AT+BAND?",
    "AT+NETWORKID?",
    "AT+ADDRESS?",
    "AT+PARAMETER?",
    "AT+IPR?",
];

/// Drives one command/response exchange at a time over a [`RadioChannel`].
///
/// Borrowing the channel mutably keeps the session loop from reading
/// replies while the configurator is waiting on them.
pub struct ModemConfigurator<'a> {
    channel: &'a mut RadioChannel,
    timeout: Duration,
}

impl<'a> ModemConfigurator<'a> {
    pub fn new(channel: &'a mut RadioChannel, timeout: Duration) -> Self {
        ModemConfigurator { channel, timeout }
    }

    /// Send `command` and wait for the modem's reply.
    ///
    /// A reply starting with `+` is returned without the `+`; any other first
    /// line is [`Error::InvalidResponse`]; silence for the whole timeout is
    /// [`Error::Timeout`].
    pub async fn exchange(&mut self, command: &str) -> Result<String> {
        let line = format!("{}\r\n", command.trim_end_matches(['\r', '\n']));
        debug!("modem exchange: {}", line.trim_end());
        self.channel.try_send(line.into_bytes())?;
        match self.channel.recv_line(self.timeout).await? {
            Some(reply) => match reply.strip_prefix('+') {
                Some(body) => Ok(body.to_string()),
                None => Err(Error::InvalidResponse(reply)),
            },
            None => {
                warn!("No response from modem after {:?}", self.timeout);
                Err(Error::Timeout)
            }
        }
    }

    /// [`exchange`](Self::exchange), additionally mapping `+ERR=<code>` to [`Error::ModemRejected`].
    pub async fn command(&mut self, command: &str) -> Result<String> {
        let reply = self.exchange(command).await?;
        match reply.strip_prefix(ERR_PREFIX) {
            Some(code) => Err(Error::ModemRejected(code.to_string())),
            None => Ok(reply),
        }
    }

    /// Bare `AT` probe.
    pub async fn try_initialize(&mut self) -> Result<()> {
        self.command("AT").await.map(|_| ())
    }

    pub async fn initialize(&mut self) -> bool {
        match self.try_initialize().await {
            Ok(()) => {
                info!("Modem responded to probe");
                true
            }
            Err(e) => {
                warn!("Modem probe failed: {}", e);
                false
            }
        }
    }

    /// Push every setting in `config`, stopping at the first failed exchange.
    pub async fn try_apply_all(&mut self, config: &RadioConfig) -> Result<()> {
        for command in config_commands(config) {
            self.command(&command).await?;
        }
        info!(
            "Radio configured: address {} on network {} at {} Hz",
            config.ground_address, config.network_id, config.band
        );
        Ok(())
    }

    pub async fn apply_all(&mut self, config: &RadioConfig) -> bool {
        match self.try_apply_all(config).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Radio configuration failed: {}", e);
                false
            }
        }
    }

    /// Probe the modem, then run [`DIAGNOSTIC_QUERIES`].
    ///
    /// Each entry pairs the query with its reply; a query the modem answered
    /// badly is `None`. A timeout ends the sweep with an error.
    pub async fn query_info(&mut self) -> Result<Vec<(String, Option<String>)>> {
        self.try_initialize().await?;
        let mut info = Vec::with_capacity(DIAGNOSTIC_QUERIES.len());
        for query in DIAGNOSTIC_QUERIES {
            let reply = match self.command(query).await {
                Ok(reply) => Some(reply),
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(e) => {
                    warn!("{} failed: {}", query, e);
                    None
                }
            };
            info.push((query.to_string(), reply));
        }
        Ok(info)
    }
}

/// The bring-up command sequence for `config`, in the order the modem expects it.
pub fn config_commands(config: &RadioConfig) -> Vec<String> {
    vec![
        format!(
            "AT+PARAMETER={},{},{},{}",
            config.spreading_factor, config.bandwidth, config.coding_rate, config.preamble
        ),
        format!("AT+IPR={}", config.uart_baud),
        format!("AT+BAND={}", config.band),
        format!("AT+NETWORKID={}", config.network_id),
        format!("AT+ADDRESS={}", config.ground_address),
    ]
}
