// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Keithley 2600 series driver
//!
//! The SMU is driven with TSP statements sent as text lines over its raw
//! socket port (5025 by default). Only channel A (`smua`) is used.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;

use crate::error::{BenchError, BenchResult};
use crate::source::SourceDriver;

/// Default raw socket port of the instrument
pub const KEITHLEY_DEFAULT_PORT: u16 = 5025;

const IDN_MARKER: &str = "KEITHLEY";

type SmuStream = BufStream<TcpStream>;

/// Keithley 2600 SMU on a TCP socket
///
/// A query abandoned on timeout drops the socket so that a late answer is
/// never taken for the reply to the next query; the socket is reopened on
/// the next exchange.
#[derive(Debug)]
pub struct Keithley2600 {
    target: String,
    idn: String,
    timeout: Duration,
    stream: Mutex<Option<SmuStream>>,
    connected: AtomicBool,
}

async fn open_stream(target: &str, timeout: Duration) -> BenchResult<SmuStream> {
    match time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(BufStream::new(stream)),
        Ok(Err(e)) => Err(BenchError::HostUnreachable {
            host: target.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(BenchError::HostUnreachable {
            host: target.to_string(),
            reason: format!("no answer within {} ms", timeout.as_millis()),
        }),
    }
}

impl Keithley2600 {
    /// Connect and check the identity string
    ///
    /// ### Errors
    ///
    /// `HostUnreachable` when the socket cannot be opened, `DeviceNotReady`
    /// when the instrument does not identify as a Keithley.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> BenchResult<Self> {
        let target = format!("{host}:{port}");
        let stream = open_stream(&target, timeout).await?;

        let mut source = Self {
            target,
            idn: String::new(),
            timeout,
            stream: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
        };
        let idn = source.query("*IDN?").await?;
        if !idn.to_uppercase().contains(IDN_MARKER) {
            return Err(BenchError::DeviceNotReady(format!(
                "{} is not a Keithley instrument: {idn}",
                source.target
            )));
        }
        source.idn = idn;
        Ok(source)
    }

    fn lost(&self, err: BenchError) -> BenchError {
        if err.is_transport_fault() {
            self.connected.store(false, Ordering::SeqCst);
        }
        err
    }

    fn timed_out(&self) -> BenchError {
        self.lost(BenchError::Timeout(self.timeout.as_millis() as u64))
    }

    /// Socket to talk on, reopened after an abandoned exchange
    async fn reopen<'a>(&self, slot: &'a mut Option<SmuStream>) -> BenchResult<&'a mut SmuStream> {
        if slot.is_none() {
            debug!("Reopening SMU socket {}", self.target);
            let stream = open_stream(&self.target, self.timeout)
                .await
                .map_err(|e| self.lost(e))?;
            self.connected.store(true, Ordering::SeqCst);
            *slot = Some(stream);
        }
        slot.as_mut()
            .ok_or_else(|| BenchError::DeviceNotReady(format!("{} is closed", self.target)))
    }

    /// Send one TSP statement
    pub async fn write(&self, command: &str) -> BenchResult<()> {
        debug!("SMU <- {command}");
        let mut guard = self.stream.lock().await;
        let stream = self.reopen(&mut guard).await?;
        let io = async {
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        };
        match time::timeout(self.timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *guard = None;
                Err(self.lost(e.into()))
            }
            Err(_) => {
                *guard = None;
                Err(self.timed_out())
            }
        }
    }

    /// Send one statement and read the answer line
    pub async fn query(&self, command: &str) -> BenchResult<String> {
        debug!("SMU <- {command}");
        let mut guard = self.stream.lock().await;
        let stream = self.reopen(&mut guard).await?;
        let io = async {
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            let mut line = String::new();
            stream.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        };
        let line = match time::timeout(self.timeout, io).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                *guard = None;
                return Err(self.lost(e.into()));
            }
            Err(_) => {
                *guard = None;
                return Err(self.timed_out());
            }
        };
        if line.is_empty() {
            *guard = None;
            return Err(self.lost(BenchError::Io("connection closed by instrument".to_string())));
        }
        let answer = line.trim().to_string();
        debug!("SMU -> {answer}");
        Ok(answer)
    }
}

#[async_trait]
impl SourceDriver for Keithley2600 {
    async fn prepare(&self, current_limit: f64) -> BenchResult<()> {
        self.write("smua.source.func = smua.OUTPUT_DCVOLTS").await?;
        self.write(&format!("smua.source.limiti = {current_limit}")).await?;
        self.write("smua.source.output = smua.OUTPUT_ON").await
    }

    async fn set_level(&self, volts: f64) -> BenchResult<()> {
        self.write(&format!("smua.source.levelv = {volts}")).await
    }

    async fn measure_current(&self) -> BenchResult<f64> {
        let answer = self.query("print(smua.measure.i())").await?;
        answer.parse::<f64>().map_err(|_| {
            BenchError::MalformedResponse(format!("current reading '{answer}' is not a number"))
        })
    }

    async fn output_off(&self) -> BenchResult<()> {
        let result = self.write("smua.source.output = smua.OUTPUT_OFF").await;
        if let Err(e) = &result {
            warn!("Could not switch {} output off: {e}", self.target);
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("keithley {} ({})", self.target, self.idn)
    }
}
