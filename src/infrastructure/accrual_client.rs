use crate::domain::accrual::{AccrualReport, AuthorityResponse};
use crate::domain::order::OrderNumber;
use crate::domain::ports::AccrualAuthority;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for the accrual calculation service.
///
/// Queries `GET {base_url}/api/orders/{number}` and maps each HTTP answer to an
/// [`AuthorityResponse`]. Only connection-level failures become errors.
#[derive(Clone)]
pub struct HttpAccrualAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualAuthority {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn order_url(&self, number: &OrderNumber) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }
}

/// Seconds form of `Retry-After`; the HTTP-date form is treated as absent.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl AccrualAuthority for HttpAccrualAuthority {
    async fn query(&self, number: &OrderNumber) -> Result<AuthorityResponse> {
        let response = self.client.get(self.order_url(number)).send().await?;
        let status = response.status();
        debug!(order = %number, status = status.as_u16(), "Accrual authority answered");

        let answer = match status {
            StatusCode::OK => match response.json::<AccrualReport>().await {
                Ok(report) if report.order == *number => AuthorityResponse::Resolved(report),
                Ok(report) => {
                    warn!(order = %number, reported = %report.order, "Accrual report for another order");
                    AuthorityResponse::Unrecognized {
                        detail: format!("report for order {} instead of {number}", report.order),
                    }
                }
                Err(e) => {
                    warn!(order = %number, error = %e, "Undecodable accrual report");
                    AuthorityResponse::Unrecognized {
                        detail: format!("undecodable body: {e}"),
                    }
                }
            },
            StatusCode::NO_CONTENT => AuthorityResponse::NotRegistered,
            StatusCode::TOO_MANY_REQUESTS => AuthorityResponse::RateLimited {
                retry_after: parse_retry_after(response.headers().get(RETRY_AFTER)),
            },
            other => AuthorityResponse::Unrecognized {
                detail: format!("unexpected status {other}"),
            },
        };
        Ok(answer)
    }
}
