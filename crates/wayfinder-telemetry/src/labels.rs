//! Label names and typed label values
//!
//! Label tuples identify one time series within an instrument; keeping the
//! names and the well-known values in one place prevents drift between the
//! registry definitions and the collector call sites.

use std::fmt;

/// Common label names used across metrics
pub struct LabelNames;

impl LabelNames {
    pub const METHOD: &'static str = "method";
    pub const ROUTE: &'static str = "route";
    pub const STATUS_CODE: &'static str = "status_code";
    pub const SERVICE: &'static str = "service";
    pub const STAGE: &'static str = "stage";
    pub const PROVIDER: &'static str = "provider";
    pub const ERROR_TYPE: &'static str = "error_type";
    pub const VERSION: &'static str = "version";
    pub const ENVIRONMENT: &'static str = "environment";
}

/// Payment pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStage {
    OrderCreation,
    PaymentProcessing,
    IsolatedVerification,
}

impl PaymentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStage::OrderCreation => "order_creation",
            PaymentStage::PaymentProcessing => "payment_processing",
            PaymentStage::IsolatedVerification => "isolated_verification",
        }
    }
}

impl fmt::Display for PaymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentProvider {
    Wechat,
    Alipay,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Wechat => "wechat",
            PaymentProvider::Alipay => "alipay",
        }
    }

    /// Match a free-form token (path segment, body field, query value)
    /// against the known providers. Aliases cover the localized spellings
    /// seen in provider callbacks.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.to_ascii_lowercase();
        if token.contains("wechat") || token.contains("weixin") {
            Some(PaymentProvider::Wechat)
        } else if token.contains("alipay") || token.contains("zhifubao") {
            Some(PaymentProvider::Alipay)
        } else {
            None
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
