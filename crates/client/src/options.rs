use std::time::Duration;

use skein_protocol::v1::Connect;
use skein_util::DEFAULT_INBOX_PREFIX;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Reported to the server in CONNECT.
    pub name: Option<String>,
    /// Whether the server echoes this connection's own publishes back to it.
    pub echo: bool,
    pub verbose: bool,
    pub pedantic: bool,
    /// Advertise HPUB/HMSG support.
    pub headers: bool,
    /// Deadline for the INFO / CONNECT / PING / PONG exchange.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub inbox_prefix: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            name: None,
            echo: true,
            verbose: false,
            pedantic: false,
            headers: true,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
        }
    }
}

impl ConnectOptions {
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn with_echo(self, echo: bool) -> Self {
        Self { echo, ..self }
    }

    pub fn with_headers(self, headers: bool) -> Self {
        Self { headers, ..self }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn with_inbox_prefix(self, inbox_prefix: impl Into<String>) -> Self {
        Self {
            inbox_prefix: inbox_prefix.into(),
            ..self
        }
    }

    pub(crate) fn to_connect(&self) -> Connect {
        Connect {
            verbose: self.verbose,
            pedantic: self.pedantic,
            name: self.name.clone(),
            echo: self.echo,
            headers: self.headers,
            ..Connect::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Members of the same queue group share the subject's messages.
    pub queue_group: Option<String>,
    /// Close the subscription after this many deliveries.
    pub max: Option<u64>,
}

impl SubscribeOptions {
    pub fn with_queue_group(self, queue_group: impl Into<String>) -> Self {
        Self {
            queue_group: Some(queue_group.into()),
            ..self
        }
    }

    pub fn with_max(self, max: u64) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }
}
