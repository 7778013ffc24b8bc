//! Request information for rate limiting.

use std::net::IpAddr;

/// Optional context about the request being limited.
///
/// Every defined field is checked against the deny list alongside the identifier.
#[derive(Debug, Clone, Default)]
pub struct RateLimitRequest {
    /// IP address of the request origin.
    pub ip: Option<IpAddr>,
    /// User agent of the client.
    pub user_agent: Option<String>,
    /// Country of the request origin, as resolved by the caller.
    pub country: Option<String>,
    /// How many tokens the request costs. Defaults to one.
    pub rate: Option<u64>,
}

impl RateLimitRequest {
    /// Create a new builder for a rate limit request.
    pub fn builder() -> RateLimitRequestBuilder {
        RateLimitRequestBuilder::default()
    }

    /// The cost of this request.
    pub fn rate(&self) -> u64 {
        self.rate.unwrap_or(1)
    }

    /// Values probed against the deny list, in priority order.
    pub(crate) fn members(&self, identifier: &str) -> Vec<String> {
        let mut members = vec![identifier.to_string()];

        members.extend(self.ip.map(|ip| ip.to_string()));
        members.extend(self.user_agent.clone());
        members.extend(self.country.clone());

        members
    }
}

/// Builder for creating rate limit requests.
#[derive(Debug, Default)]
pub struct RateLimitRequestBuilder {
    request: RateLimitRequest,
}

impl RateLimitRequestBuilder {
    /// Set the IP address.
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.request.ip = Some(ip);
        self
    }

    /// Set the IP address from a string.
    pub fn ip_str(mut self, ip: &str) -> Result<Self, std::net::AddrParseError> {
        self.request.ip = Some(ip.parse()?);
        Ok(self)
    }

    /// Set the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.request.user_agent = Some(user_agent.into());
        self
    }

    /// Set the country.
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.request.country = Some(country.into());
        self
    }

    /// Set the cost of the request.
    pub fn rate(mut self, rate: u64) -> Self {
        self.request.rate = Some(rate);
        self
    }

    /// Build the rate limit request.
    pub fn build(self) -> RateLimitRequest {
        self.request
    }
}
