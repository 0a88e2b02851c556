use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use orderflow_payments::PaymentStatus;

use super::{CreateIntentRequest, GatewayError, GatewayRefund, PaymentGateway, PaymentIntent, RefundParams};

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    intents: HashMap<String, PaymentIntent>,
    requests: Vec<CreateIntentRequest>,
    refunds: Vec<RefundParams>,
    fail_next_create: Option<GatewayError>,
    fail_next_refund: Option<GatewayError>,
    hang_next: bool,
}

/// Scriptable gateway for tests and local runs.
///
/// Intents are created as `requires_payment_method` with ids `pi_1`,
/// `pi_2`, ...; tests move them along with [`InMemoryGateway::set_status`].
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_create(&self, err: GatewayError) {
        self.state().fail_next_create = Some(err);
    }

    pub fn fail_next_refund(&self, err: GatewayError) {
        self.state().fail_next_refund = Some(err);
    }

    /// The next call never answers.
    pub fn hang_next(&self) {
        self.state().hang_next = true;
    }

    /// Change what the gateway reports for an intent.
    pub fn set_status(&self, intent_id: &str, status: PaymentStatus, charge_id: Option<&str>) {
        if let Some(intent) = self.state().intents.get_mut(intent_id) {
            intent.status = status;
            if let Some(charge) = charge_id {
                intent.charge_id = Some(charge.to_string());
                intent.receipt_url = Some(format!("https://receipts.example.test/{charge}"));
            }
        }
    }

    pub fn create_requests(&self) -> Vec<CreateIntentRequest> {
        self.state().requests.clone()
    }

    pub fn refunds(&self) -> Vec<RefundParams> {
        self.state().refunds.clone()
    }

    fn take_hang(&self) -> bool {
        std::mem::take(&mut self.state().hang_next)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_payment_intent(&self, request: CreateIntentRequest) -> Result<PaymentIntent, GatewayError> {
        if self.take_hang() {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("pi_{}", state.next_id);
        let intent = PaymentIntent {
            id: id.clone(),
            client_secret: format!("{id}_secret"),
            status: PaymentStatus::RequiresPaymentMethod,
            charge_id: None,
            receipt_url: None,
            failure_message: None,
            failure_code: None,
        };
        state.intents.insert(id, intent.clone());
        state.requests.push(request);
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        if self.take_hang() {
            std::future::pending::<()>().await;
        }

        self.state()
            .intents
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownIntent(id.to_string()))
    }

    async fn refund(&self, params: RefundParams) -> Result<GatewayRefund, GatewayError> {
        if self.take_hang() {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        if let Some(err) = state.fail_next_refund.take() {
            return Err(err);
        }
        if !state.intents.contains_key(&params.payment_intent_id) {
            return Err(GatewayError::UnknownIntent(params.payment_intent_id));
        }
        state.refunds.push(params);
        Ok(GatewayRefund {
            id: format!("re_{}", state.refunds.len()),
        })
    }
}
