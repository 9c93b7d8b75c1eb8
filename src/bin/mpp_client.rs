// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tokio::time::{timeout, Duration};
use tokio_modbus::prelude::*;

use rust_ddii_bench::modbus::registers::{
    decode_u32_be, words_to_bytes, MppRegister, MPP_UNIT_ID_DEFAULT,
};

/// Modbus client dumping the holding registers of a DDII measurement module
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Modbus server address (device or relay)
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    /// Modbus server port
    #[clap(long, default_value = "5012")]
    port: u16,

    /// Unit id of the measurement module
    #[clap(long, default_value_t = MPP_UNIT_ID_DEFAULT)]
    unit: u8,

    /// Starting holding register address
    #[clap(long, default_value = "0")]
    register: u16,

    /// Number of registers to read
    #[clap(long, default_value = "16")]
    quantity: u16,

    /// Response timeout in milliseconds
    #[clap(long, default_value = "1000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();
    let response_timeout = Duration::from_millis(args.timeout_ms);

    let socket_addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .with_context(|| format!("Invalid server address {}:{}", args.address, args.port))?;
    println!("Connecting to Modbus server at {}", socket_addr);

    let mut ctx = timeout(response_timeout, tcp::connect_slave(socket_addr, Slave(args.unit)))
        .await
        .map_err(|_| anyhow!("No answer from {socket_addr} within {:?}", response_timeout))??;

    println!(
        "Reading {} holding registers of unit {} starting at 0x{:04X}",
        args.quantity, args.unit, args.register
    );
    let response = timeout(
        response_timeout,
        ctx.read_holding_registers(args.register, args.quantity),
    )
    .await
    .map_err(|_| anyhow!("Read timed out after {:?}", response_timeout))??
    .map_err(|code| anyhow!("Device exception: {code:?}"))?;

    println!("Raw register values: {:?}", response);

    // Named registers of the MPP map
    for (i, value) in response.iter().enumerate() {
        let address = args.register.wrapping_add(i as u16);
        match MppRegister::from_address(address) {
            Some(register) => println!(
                "0x{:04X} {:<14} = {} (0x{:04X})",
                address,
                register.name(),
                value,
                value
            ),
            None => println!("0x{:04X} {:<14} = {}", address, "", value),
        }
    }

    // First 32-bit histogram bin, when the window covers it
    let hist = MppRegister::Hist32.address();
    if let Some(start) = hist.checked_sub(args.register).map(usize::from) {
        if let Some(words) = response.get(start..start + 2) {
            let bins = decode_u32_be(&words_to_bytes(words));
            println!("HIST_32 bin 0: {}", bins.first().copied().unwrap_or(0));
        }
    }

    if let Err(e) = ctx.disconnect().await {
        log::warn!("Disconnect failed: {e}");
    }
    Ok(())
}
