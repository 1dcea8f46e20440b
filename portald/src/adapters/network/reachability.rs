// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const CONNECT_TIMEOUT_MS: u64 = 1000;
const HTTP_TIMEOUT_SECS: u64 = 3;

#[derive(ThisError, Debug)]
pub enum NetError {
    #[error("http probe failed: {0}")]
    Http(#[from] reqwest::Error),
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

pub async fn is_local_port_open(port: u16) -> bool {
    let limit = Duration::from_millis(CONNECT_TIMEOUT_MS);
    matches!(
        timeout(limit, TcpStream::connect(loopback(port))).await,
        Ok(Ok(_stream))
    )
}

pub async fn is_local_port_bound(port: u16) -> bool {
    match TcpListener::bind(loopback(port)).await {
        Ok(_listener) => false,
        Err(err) => err.kind() == io::ErrorKind::AddrInUse,
    }
}

pub fn http_client() -> Result<reqwest::Client, NetError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Any answer below 500 counts as ready; connection failures read as "not yet".
pub async fn is_http_ready(client: &reqwest::Client, url: &str) -> Result<bool, NetError> {
    match client.get(url).send().await {
        Ok(response) => Ok(response.status().as_u16() < 500),
        Err(err) if err.is_connect() || err.is_timeout() || err.is_request() => Ok(false),
        Err(err) => Err(NetError::Http(err)),
    }
}
