// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Tests for the relay Modbus server
//!
//! These tests start a relay listener on an ephemeral port and talk to it
//! with a tokio-modbus client: reading the mirrored block, writing into it,
//! addressing outside of it, and behaviour after shutdown.

use std::net::SocketAddr;
use std::str::FromStr;

use rust_ddii_bench::modbus::relay_server::RELAY_BLOCK_SIZE;
use rust_ddii_bench::modbus::{RelayServer, RelayStore};
use tokio_modbus::prelude::*;

/// Test utility function to start a relay in the background
async fn start_test_relay() -> Result<RelayServer, Box<dyn std::error::Error>> {
    // Use port 0 to let the OS assign an available port
    let socket_addr = SocketAddr::from_str("127.0.0.1:0")?;
    let store = RelayStore::new(RELAY_BLOCK_SIZE);
    let relay = RelayServer::start(socket_addr, store).await?;
    println!("Test relay started on: {}", relay.local_addr());
    Ok(relay)
}

#[tokio::test]
async fn test_read_mirrored_registers() -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    relay.store().publish(0, &[2, 1, 0, 0, 0, 0, 0, 640, 320]);

    let mut ctx = tcp::connect(relay.local_addr()).await?;
    let data = ctx.read_holding_registers(7, 2).await??;
    assert_eq!(data, vec![640, 320]);

    // Input registers see the same block
    let data = ctx.read_input_registers(0, 2).await??;
    assert_eq!(data, vec![2, 1]);

    ctx.disconnect().await?;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_any_unit_id_reaches_the_block() -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    relay.store().publish(0x79, &[660]);

    let mut ctx = tcp::connect_slave(relay.local_addr(), Slave(14)).await?;
    let data = ctx.read_holding_registers(0x79, 1).await??;
    assert_eq!(data, vec![660]);

    ctx.disconnect().await?;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_client_writes_land_in_the_mirror() -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    let mut ctx = tcp::connect(relay.local_addr()).await?;

    ctx.write_single_register(2, 999).await??;
    ctx.write_multiple_registers(10, &[1, 2, 3]).await??;

    let data = ctx.read_holding_registers(2, 1).await??;
    assert_eq!(data, vec![999]);
    assert_eq!(relay.store().snapshot(10, 3), Some(vec![1, 2, 3]));

    ctx.disconnect().await?;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_out_of_block_access_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    let mut ctx = tcp::connect(relay.local_addr()).await?;

    let last = (RELAY_BLOCK_SIZE - 1) as u16;
    assert!(ctx.read_holding_registers(last, 1).await?.is_ok());

    let result = ctx.read_holding_registers(last, 2).await?;
    assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));

    let result = ctx.write_single_register(RELAY_BLOCK_SIZE as u16, 1).await?;
    assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));

    ctx.disconnect().await?;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_function_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    let mut ctx = tcp::connect(relay.local_addr()).await?;

    let result = ctx.read_coils(0, 1).await?;
    assert_eq!(result, Err(ExceptionCode::IllegalFunction));

    ctx.disconnect().await?;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_releases_the_port_and_closes_open_clients(
) -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    let addr = relay.local_addr();
    let mut ctx = tcp::connect(addr).await?;
    assert!(ctx.read_holding_registers(0, 1).await?.is_ok());
    assert_eq!(relay.client_count(), 1);

    relay.stop().await;

    // The connection accepted before the stop is closed by the server
    for _ in 0..3 {
        assert!(ctx.read_holding_registers(0, 1).await.is_err());
    }

    // The listen address can be bound again
    let again = RelayServer::start(addr, RelayStore::new(RELAY_BLOCK_SIZE)).await?;
    assert_eq!(again.local_addr(), addr);
    again.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_client_disconnect_is_tracked() -> Result<(), Box<dyn std::error::Error>> {
    let relay = start_test_relay().await?;
    let mut ctx = tcp::connect(relay.local_addr()).await?;
    assert!(ctx.read_holding_registers(0, 1).await?.is_ok());
    assert_eq!(relay.client_count(), 1);

    ctx.disconnect().await?;
    for _ in 0..50 {
        if relay.client_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(relay.client_count(), 0);

    relay.stop().await;
    Ok(())
}
