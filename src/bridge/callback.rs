//! Custody service callbacks
//!
//! Transport-agnostic handlers for the two inbound notifications of the
//! custody service. Every answer is a [`CallbackResponse`] carrying a code from
//! [`CallbackCode`]; downstream error text is logged, never returned.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::BridgeError;
use super::store::{DepositStore, RechargeNotification, WithdrawStore};
use super::types::{DepositRecord, WithdrawCheck, WithdrawRecord};

/// Custody request types
pub const REQUEST_TYPE_WITHDRAWAL: i32 = 0;
pub const REQUEST_TYPE_RECHARGE: i32 = 1;

pub const ACTION_APPROVE: &str = "APPROVE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CallbackCode {
    Success = 200,
    SystemError = 1,
    ParameterError = 4,
    RequestTypeNonsupport = 2001,
    RequestDetailUnmarshal = 2002,
    RequestDetailParameter = 2003,
    RequestDetailToMismatch = 2004,
    IpWhiteList = 2005,
    RequestDetailAmount = 2006,
    WithdrawConfirmReject = 2007,
    WithdrawConfirmNotFound = 2008,
}

impl CallbackCode {
    #[inline]
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn message(&self) -> &'static str {
        match self {
            CallbackCode::Success => "success",
            CallbackCode::SystemError => "system error",
            CallbackCode::ParameterError => "parameter error",
            CallbackCode::RequestTypeNonsupport => "request type nonsupport",
            CallbackCode::RequestDetailUnmarshal => "request detail unmarshal err",
            CallbackCode::RequestDetailParameter => "request detail check err",
            CallbackCode::RequestDetailToMismatch => "request detail to mismatch",
            CallbackCode::IpWhiteList => "ip limit",
            CallbackCode::RequestDetailAmount => "request detail amount",
            CallbackCode::WithdrawConfirmReject => "withdraw confirm reject",
            CallbackCode::WithdrawConfirmNotFound => "withdraw record not found",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub request_id: String,
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl CallbackResponse {
    fn new(request_id: &str, code: CallbackCode) -> Self {
        Self {
            request_id: request_id.to_string(),
            code: code.code(),
            message: code.message().to_string(),
            action: None,
        }
    }

    fn approve(request_id: &str) -> Self {
        Self {
            action: Some(ACTION_APPROVE.to_string()),
            ..Self::new(request_id, CallbackCode::Success)
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CallbackCode::Success.code()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionNotify {
    pub request_type: i32,
    pub request_id: String,
    pub request_detail: serde_json::Value,
    #[serde(default)]
    pub extra_info: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RechargeDetail {
    tx_hash: String,
    from: String,
    to: String,
    amount: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalConfirm {
    pub request_id: String,
    pub request_detail: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfirmDetail {
    /// Our own request id, echoed by the custody service
    api_request_id: String,
    from: String,
    to: String,
    amount: String,
}

/// Exact match against a comma separated allow list; an empty list allows nobody
pub fn check_ip_allowed(client_ip: &str, allow_list: &str) -> bool {
    allow_list
        .split(',')
        .map(str::trim)
        .any(|ip| !ip.is_empty() && ip == client_ip)
}

pub struct CallbackHandler<K> {
    store: Arc<K>,
    custody_address: String,
    allow_list: String,
}

impl<K: DepositStore + WithdrawStore> CallbackHandler<K> {
    pub fn new(store: Arc<K>, custody_address: &str, allow_list: &str) -> Self {
        Self {
            store,
            custody_address: custody_address.to_string(),
            allow_list: allow_list.to_string(),
        }
    }

    /// Recharge notification: confirms a scanned deposit or records one the
    /// scanner has not reached yet
    pub async fn transaction_notify(&self, client_ip: &str, notify: &TransactionNotify) -> CallbackResponse {
        let request_id = notify.request_id.as_str();
        if !check_ip_allowed(client_ip, &self.allow_list) {
            warn!(client_ip, "Callback from address outside allow list");
            return CallbackResponse::new(request_id, CallbackCode::IpWhiteList);
        }
        if request_id.is_empty() {
            return CallbackResponse::new(request_id, CallbackCode::ParameterError);
        }
        if notify.request_type != REQUEST_TYPE_RECHARGE {
            return CallbackResponse::new(request_id, CallbackCode::RequestTypeNonsupport);
        }

        let detail: RechargeDetail = match serde_json::from_value(notify.request_detail.clone()) {
            Ok(detail) => detail,
            Err(e) => {
                warn!(request_id, "Recharge detail does not decode: {}", e);
                return CallbackResponse::new(request_id, CallbackCode::RequestDetailUnmarshal);
            }
        };
        if detail.from.is_empty() || detail.to.is_empty() || detail.tx_hash.is_empty() {
            return CallbackResponse::new(request_id, CallbackCode::RequestDetailParameter);
        }
        if detail.to != self.custody_address {
            warn!(request_id, to = %detail.to, "Recharge not addressed to custody");
            return CallbackResponse::new(request_id, CallbackCode::RequestDetailToMismatch);
        }
        let Ok(amount) = detail.amount.parse::<u64>() else {
            return CallbackResponse::new(request_id, CallbackCode::RequestDetailAmount);
        };

        let notification = RechargeNotification {
            request_id: request_id.to_string(),
            request_type: notify.request_type,
            tx_hash: detail.tx_hash.clone(),
            from: detail.from.clone(),
            to: detail.to.clone(),
            amount,
            raw: notify.request_detail.to_string(),
        };

        match self.apply_recharge(&notification).await {
            Ok(code) => {
                if code == CallbackCode::Success {
                    info!(request_id, tx_hash = %notification.tx_hash, amount, "Recharge notification accepted");
                }
                CallbackResponse::new(request_id, code)
            }
            Err(e) => {
                error!(request_id, "Failed to store recharge notification: {}", e);
                CallbackResponse::new(request_id, CallbackCode::SystemError)
            }
        }
    }

    async fn apply_recharge(
        &self,
        notification: &RechargeNotification,
    ) -> Result<CallbackCode, BridgeError> {
        match self.store.get_deposit_by_tx_hash(&notification.tx_hash).await? {
            Some(deposit) => {
                if !recharge_matches(&deposit, notification) {
                    warn!(
                        request_id = %notification.request_id,
                        tx_hash = %notification.tx_hash,
                        stored_from = %deposit.btc_from,
                        stored_value = deposit.btc_value,
                        "Recharge notification disagrees with scanned deposit"
                    );
                    return Ok(CallbackCode::SystemError);
                }
                self.store
                    .record_recharge_notification(notification, Some(deposit.id))
                    .await?;
            }
            None => {
                self.store.insert_deposit_from_notify(notification).await?;
                self.store
                    .record_recharge_notification(notification, None)
                    .await?;
            }
        }
        Ok(CallbackCode::Success)
    }

    /// Pre-signing check of a withdrawal the custody service is about to send
    pub async fn withdrawal_confirm(&self, client_ip: &str, confirm: &WithdrawalConfirm) -> CallbackResponse {
        let request_id = confirm.request_id.as_str();
        if !check_ip_allowed(client_ip, &self.allow_list) {
            warn!(client_ip, "Callback from address outside allow list");
            return CallbackResponse::new(request_id, CallbackCode::IpWhiteList);
        }

        let detail: ConfirmDetail = match serde_json::from_value(confirm.request_detail.clone()) {
            Ok(detail) => detail,
            Err(e) => {
                warn!(request_id, "Confirm detail does not decode: {}", e);
                return CallbackResponse::new(request_id, CallbackCode::RequestDetailUnmarshal);
            }
        };
        if detail.api_request_id.is_empty() {
            return CallbackResponse::new(request_id, CallbackCode::RequestDetailParameter);
        }
        let Ok(amount) = detail.amount.parse::<u64>() else {
            return CallbackResponse::new(request_id, CallbackCode::RequestDetailAmount);
        };

        let record = match self
            .store
            .get_withdraw_by_request_id(&detail.api_request_id)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(request_id, api_request_id = %detail.api_request_id, "Withdrawal to confirm is unknown");
                return CallbackResponse::new(request_id, CallbackCode::WithdrawConfirmNotFound);
            }
            Err(e) => {
                error!(request_id, "Failed to load withdrawal: {}", e);
                return CallbackResponse::new(request_id, CallbackCode::SystemError);
            }
        };

        if !withdraw_matches(&record, &detail.from, &detail.to, amount) {
            warn!(
                request_id,
                api_request_id = %detail.api_request_id,
                from = %detail.from,
                to = %detail.to,
                amount,
                "Withdrawal confirmation disagrees with stored record"
            );
            return CallbackResponse::new(request_id, CallbackCode::WithdrawConfirmReject);
        }

        let check = WithdrawCheck {
            rollup_tx_hash: record.rollup_tx_hash.clone(),
            btc_from: record.btc_from.clone(),
            btc_to: record.btc_to.clone(),
            btc_value: record.btc_real_value,
        };
        if let Err(e) = self.store.record_withdraw_check(&check).await {
            error!(request_id, "Failed to record withdrawal check: {}", e);
            return CallbackResponse::new(request_id, CallbackCode::SystemError);
        }

        info!(request_id, api_request_id = %detail.api_request_id, "Withdrawal approved");
        CallbackResponse::approve(request_id)
    }
}

fn recharge_matches(deposit: &DepositRecord, notification: &RechargeNotification) -> bool {
    deposit.btc_from.eq_ignore_ascii_case(&notification.from)
        && deposit.btc_to.eq_ignore_ascii_case(&notification.to)
        && deposit.btc_value == notification.amount
}

fn withdraw_matches(record: &WithdrawRecord, from: &str, to: &str, amount: u64) -> bool {
    record.btc_from.eq_ignore_ascii_case(from)
        && record.btc_to.eq_ignore_ascii_case(to)
        && record.btc_real_value == amount
}
