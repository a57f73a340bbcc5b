use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use connect_proxy_utils::{
    Authority, ConnectProxy, ErrorBody, HttpResponse, Prebuffered, ProxyOpts, ResponsePolicy,
    SocketClose,
};
use n0_error::{Result, StackResultExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::info;

#[derive(Parser)]
struct PolicyOpts {
    /// Status code sent when the upstream can't be reached.
    #[clap(long, default_value_t = 502)]
    error_status: u16,
    /// Fixed body sent with the error status.
    #[clap(long, conflicts_with = "diagnostic_body")]
    error_body: Option<String>,
    /// Send a short description of the dial failure as the body.
    #[clap(long)]
    diagnostic_body: bool,
    /// Don't send `Connection: close` with error responses.
    #[clap(long)]
    no_connection_close: bool,
    /// Close the connection after every error response.
    #[clap(long)]
    always_close_socket: bool,
}

impl PolicyOpts {
    fn to_policy(&self) -> Result<ResponsePolicy> {
        let body = match (&self.error_body, self.diagnostic_body) {
            (Some(body), _) => ErrorBody::fixed(body.clone()),
            (None, true) => ErrorBody::Diagnostic,
            (None, false) => ErrorBody::Empty,
        };
        let close_socket = if self.always_close_socket {
            SocketClose::Always
        } else {
            SocketClose::FollowHeader
        };
        Ok(ResponsePolicy::from_code(self.error_status)?
            .body(body)
            .send_connection_close(!self.no_connection_close)
            .close_socket(close_socket))
    }
}

#[derive(Parser)]
enum Cli {
    /// Run a CONNECT proxy.
    Proxy {
        #[clap(short, long, default_value_t = 8080)]
        port: u16,
        /// Upstream connect timeout in milliseconds.
        #[clap(long, default_value_t = 10_000)]
        connect_timeout_ms: u64,
        #[clap(flatten)]
        policy: PolicyOpts,
    },
    /// Send CONNECT requests over a single connection and print the responses.
    Request {
        /// Proxy address (e.g. "127.0.0.1:8080").
        proxy: SocketAddr,
        /// CONNECT target (e.g. "example.com:443").
        target: String,
        /// Number of requests to send.
        #[clap(short = 'n', default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli {
        Cli::Proxy {
            port,
            connect_timeout_ms,
            policy,
        } => cmd_proxy(port, Duration::from_millis(connect_timeout_ms), policy).await,
        Cli::Request {
            proxy,
            target,
            count,
        } => cmd_request(proxy, target, count).await,
    }
}

async fn cmd_proxy(port: u16, connect_timeout: Duration, policy: PolicyOpts) -> Result<()> {
    let opts = ProxyOpts::default()
        .connect_timeout(connect_timeout)
        .response_policy(policy.to_policy()?);
    let proxy = ConnectProxy::new(opts)?;
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let addr = listener.local_addr()?;
    info!(policy = ?proxy.opts().policy(), "configured");
    println!("CONNECT proxy listening on {addr}");
    tokio::select! {
        res = proxy.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => proxy.shutdown().await,
    }
    Ok(())
}

async fn cmd_request(proxy: SocketAddr, target: String, count: usize) -> Result<()> {
    let target = Authority::from_authority_str(&target)?;
    let stream = TcpStream::connect(proxy).await?;
    let (recv, mut send) = stream.into_split();
    let mut recv = Prebuffered::new(recv, 8192);
    for i in 0..count {
        send.write_all(target.to_connect_request().as_bytes()).await?;
        let response = HttpResponse::read(&mut recv).await?;
        println!("#{i}: {}", response.status_line().trim_end());
        if response.status.is_success() {
            println!("tunnel established");
            return Ok(());
        }
        let len = response
            .content_length()
            .context("error response without Content-Length")?;
        let mut body = vec![0u8; len];
        recv.read_exact(&mut body).await?;
        if !body.is_empty() {
            println!("{}", String::from_utf8_lossy(&body));
        }
    }
    Ok(())
}
