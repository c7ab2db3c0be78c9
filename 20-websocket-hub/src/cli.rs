use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Parser, builder::RangedU64ValueParser};

use crate::hub::HubConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port the websocket endpoint listens on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 7878)]
    pub port: u16,

    /// Address the listener binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Messages buffered per client before it is treated as a slow consumer.
    #[arg(long, default_value_t = 16, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub queue_capacity: usize,

    /// Wait up to this many milliseconds on a slow client when delivering
    /// join/leave notices. Without it notices never wait.
    #[arg(long)]
    pub notice_timeout_ms: Option<u64>,
}

impl Cli {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            notice_timeout: self.notice_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_7878() {
        let cli = Cli::try_parse_from(["websocket-hub"]).expect("parse");
        assert_eq!(cli.listen_addr(), "0.0.0.0:7878".parse().unwrap());
        assert_eq!(cli.hub_config(), HubConfig::default());
    }

    #[test]
    fn notice_timeout_is_milliseconds() {
        let cli = Cli::try_parse_from([
            "websocket-hub",
            "--port",
            "9000",
            "--notice-timeout-ms",
            "250",
        ])
        .expect("parse");
        assert_eq!(cli.port, 9000);
        assert_eq!(
            cli.hub_config().notice_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn rejects_zero_queue_capacity() {
        assert!(Cli::try_parse_from(["websocket-hub", "--queue-capacity", "0"]).is_err());
    }
}
