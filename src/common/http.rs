use std::time::Duration;

use reqwest::Client;

use crate::common::errors::LinkResult;

const DEFAULT_USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/gatelink/gatelink, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

pub struct HttpClient;

impl HttpClient {
    pub fn default_user_agent() -> String {
        DEFAULT_USER_AGENT.to_string()
    }

    pub fn new(timeout: Duration) -> LinkResult<Client> {
        Ok(Client::builder()
            .user_agent(Self::default_user_agent())
            .timeout(timeout)
            .build()?)
    }
}
