use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use taskledger_core::{
    domain::{
        approval::{ApprovalDecision, ApprovalRequest, ApprovalRequestId},
        balance::CompanyBalanceView,
        order::{CompletionReview, Order, OrderId, OrderStatus},
        payment::{EventDisposition, EventId, PaymentEvent, PaymentIntentId, ProcessedEvent},
        payout::{Payout, PayoutId, PayoutStatus},
        quote::{Proposal, ProposalId, Quote, QuoteId},
        time_entry::{NewTimeEntry, TimeEntry, TimeEntryCategory, TimeEntryId},
        Actor, ActorRole, CompanyId,
    },
    errors::{ApplicationError, DomainError, InterfaceError},
    escrow::{EscrowService, PayoutResult},
    orders::{OrderListQuery, OrderService, OrderView},
    processor::PaymentProcessor,
    quotes::{ProposalDraft, QuoteDraft, QuoteService},
    reconciler::PaymentReconciler,
    time_tracking::TimeTrackingService,
    webhook::{SignatureError, WebhookVerifier, SIGNATURE_HEADER},
    LedgerContext,
};
use tracing::{error, info, warn};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    pub quotes: QuoteService,
    pub orders: OrderService,
    pub time: TimeTrackingService,
    pub escrow: EscrowService,
    pub reconciler: PaymentReconciler,
    pub verifier: Arc<WebhookVerifier>,
}

impl ApiState {
    pub fn new(
        ctx: LedgerContext,
        processor: Arc<dyn PaymentProcessor>,
        processor_timeout: Duration,
        verifier: WebhookVerifier,
    ) -> Self {
        Self {
            quotes: QuoteService::new(ctx.clone()),
            orders: OrderService::new(ctx.clone()),
            time: TimeTrackingService::new(ctx.clone()),
            escrow: EscrowService::new(ctx.clone()),
            reconciler: PaymentReconciler::new(ctx, processor)
                .with_processor_timeout(processor_timeout),
            verifier: Arc::new(verifier),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/webhooks/payments", post(payment_webhook))
        .route("/api/v1/quotes", post(create_quote))
        .route("/api/v1/quotes/{quote_id}", get(get_quote))
        .route("/api/v1/quotes/{quote_id}/publish", post(publish_quote))
        .route("/api/v1/quotes/{quote_id}/cancel", post(cancel_quote))
        .route("/api/v1/quotes/{quote_id}/proposals", post(submit_proposal))
        .route("/api/v1/quotes/{quote_id}/proposals/{proposal_id}/accept", post(accept_proposal))
        .route("/api/v1/quotes/{quote_id}/proposals/{proposal_id}/reject", post(reject_proposal))
        .route(
            "/api/v1/quotes/{quote_id}/proposals/{proposal_id}/release",
            post(release_payment),
        )
        .route("/api/v1/orders", get(list_orders))
        .route("/api/v1/orders/{order_id}", get(get_order))
        .route("/api/v1/orders/{order_id}/payouts", get(order_payouts))
        .route("/api/v1/orders/{order_id}/time-entries", post(log_time))
        .route(
            "/api/v1/orders/{order_id}/time-entries/{entry_id}/recategorize",
            post(recategorize_entry),
        )
        .route("/api/v1/orders/{order_id}/approval-requests", post(submit_for_approval))
        .route(
            "/api/v1/orders/{order_id}/approval-requests/{request_id}/respond",
            post(customer_respond),
        )
        .route("/api/v1/orders/{order_id}/provider-complete", post(mark_provider_completed))
        .route("/api/v1/orders/{order_id}/complete", post(mark_completed))
        .route("/api/v1/orders/{order_id}/cancel", post(cancel_order))
        .route("/api/v1/payouts/{payout_id}", get(get_payout))
        .route("/api/v1/payouts/{payout_id}/status", post(update_payout_status))
        .route("/api/v1/companies/{company_id}/balance", get(company_balance))
        .route("/api/v1/events/parked", get(list_parked))
        .route("/api/v1/events/{event_id}/replay", post(replay_parked))
        .route("/api/v1/events/{event_id}/dismiss", post(dismiss_parked))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error_class: &'static str,
    pub message: &'static str,
    pub detail: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn application(error: ApplicationError, correlation_id: &str) -> Self {
        let error_class = error.error_class();
        let interface = error.into_interface(correlation_id);
        let status = match &interface {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(
                event_name = "ledger.api.failed",
                correlation_id,
                error_class,
                error = interface.message(),
                "command failed"
            );
        } else {
            info!(
                event_name = "ledger.api.rejected",
                correlation_id,
                error_class,
                error = interface.message(),
                "command rejected"
            );
        }

        // 5xx detail stays in the logs. A lost race names the state that won.
        let detail = (!status.is_server_error() || error_class == "conflict")
            .then(|| interface.message().to_string());
        Self {
            status,
            body: ErrorBody {
                error_class,
                message: interface.user_message(),
                detail,
                correlation_id: correlation_id.to_string(),
            },
        }
    }

    fn unauthorized(error: SignatureError, correlation_id: &str) -> Self {
        warn!(
            event_name = "ledger.webhook.signature_rejected",
            correlation_id,
            error = %error,
            "payment webhook signature rejected"
        );
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                error_class: "signature",
                message: "The webhook signature could not be verified.",
                detail: Some(error.to_string()),
                correlation_id: correlation_id.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("req-{}", uuid::Uuid::new_v4().simple()))
}

fn respond<T>(result: Result<T, ApplicationError>, correlation_id: &str) -> ApiResult<T> {
    result.map(Json).map_err(|error| ApiError::application(error, correlation_id))
}

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    pub actor_id: String,
    pub actor_role: ActorRole,
}

impl ActorQuery {
    fn actor(self) -> Actor {
        Actor { id: self.actor_id, role: self.actor_role }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub actor_id: String,
    pub actor_role: ActorRole,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub after: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub actor: Actor,
}

#[derive(Debug, Deserialize)]
pub struct CreateQuoteRequest {
    pub actor: Actor,
    #[serde(flatten)]
    pub draft: QuoteDraft,
}

#[derive(Debug, Deserialize)]
pub struct SubmitProposalRequest {
    pub actor: Actor,
    #[serde(flatten)]
    pub draft: ProposalDraft,
}

#[derive(Debug, Deserialize)]
pub struct AcceptProposalRequest {
    pub actor: Actor,
    pub payment_intent_id: Option<PaymentIntentId>,
}

#[derive(Debug, Deserialize)]
pub struct LogTimeRequest {
    pub actor: Actor,
    #[serde(flatten)]
    pub entry: NewTimeEntry,
}

#[derive(Debug, Deserialize)]
pub struct SubmitApprovalRequest {
    pub actor: Actor,
    pub time_entry_ids: Vec<TimeEntryId>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub actor: Actor,
    #[serde(flatten)]
    pub decision: ApprovalDecision,
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecategorizeRequest {
    pub actor: Actor,
    pub category: TimeEntryCategory,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ProviderCompleteRequest {
    pub actor: Actor,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub actor: Actor,
    pub rating: Option<u8>,
    pub review: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub order: Order,
    pub payout: PayoutResult,
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub actor: Actor,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct PayoutStatusRequest {
    pub actor: Actor,
    pub status: PayoutStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    pub actor: Actor,
    pub note: String,
}

/// Verifies the signature over the raw bytes before anything is parsed. Once verified,
/// every event is acknowledged with its disposition; only store failures answer 5xx so
/// the sender retries.
async fn payment_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EventDisposition> {
    let correlation_id = correlation_id(&headers);
    let signature = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());
    state
        .verifier
        .verify(signature, &body, Utc::now())
        .map_err(|error| ApiError::unauthorized(error, &correlation_id))?;

    match serde_json::from_slice::<PaymentEvent>(&body) {
        Ok(event) => respond(
            state.reconciler.handle_payment_event(event, &correlation_id).await,
            &correlation_id,
        ),
        Err(error) => {
            warn!(
                event_name = "ledger.webhook.malformed",
                correlation_id,
                error = %error,
                "payment webhook body is not an event, parking it"
            );
            respond(
                state.reconciler.park_malformed(&body, error.to_string(), &correlation_id).await,
                &correlation_id,
            )
        }
    }
}

async fn create_quote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateQuoteRequest>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state.quotes.create_quote(&request.actor, request.draft, &correlation_id).await,
        &correlation_id,
    )
}

async fn get_quote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(quote_id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state.quotes.get_quote(&actor.actor(), &QuoteId::new(quote_id)).await,
        &correlation_id,
    )
}

async fn publish_quote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(quote_id): Path<String>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state.quotes.publish(&request.actor, &QuoteId::new(quote_id), &correlation_id).await,
        &correlation_id,
    )
}

async fn cancel_quote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(quote_id): Path<String>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state.quotes.cancel_quote(&request.actor, &QuoteId::new(quote_id), &correlation_id).await,
        &correlation_id,
    )
}

async fn submit_proposal(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(quote_id): Path<String>,
    Json(request): Json<SubmitProposalRequest>,
) -> ApiResult<Proposal> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .quotes
            .submit_proposal(&request.actor, &QuoteId::new(quote_id), request.draft, &correlation_id)
            .await,
        &correlation_id,
    )
}

async fn accept_proposal(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((quote_id, proposal_id)): Path<(String, String)>,
    Json(request): Json<AcceptProposalRequest>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .quotes
            .accept_proposal(
                &request.actor,
                &QuoteId::new(quote_id),
                &ProposalId::new(proposal_id),
                request.payment_intent_id,
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn reject_proposal(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((quote_id, proposal_id)): Path<(String, String)>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .quotes
            .reject_proposal(
                &request.actor,
                &QuoteId::new(quote_id),
                &ProposalId::new(proposal_id),
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn release_payment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((quote_id, proposal_id)): Path<(String, String)>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Quote> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .quotes
            .release_payment(
                &request.actor,
                &QuoteId::new(quote_id),
                &ProposalId::new(proposal_id),
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn list_orders(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListOrdersQuery>,
) -> ApiResult<Vec<OrderView>> {
    let correlation_id = correlation_id(&headers);
    let status = match query.status.as_deref() {
        Some(raw) => match OrderStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                let error = DomainError::Validation(format!("unknown order status `{raw}`"));
                return Err(ApiError::application(error.into(), &correlation_id));
            }
        },
        None => None,
    };
    let actor = Actor { id: query.actor_id, role: query.actor_role };
    let list = OrderListQuery { status, limit: query.limit, after: query.after.map(OrderId::new) };
    respond(state.orders.list_orders(&actor, list).await, &correlation_id)
}

async fn get_order(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<OrderView> {
    let correlation_id = correlation_id(&headers);
    respond(
        state.orders.get_order(&actor.actor(), &OrderId::new(order_id)).await,
        &correlation_id,
    )
}

async fn order_payouts(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<Vec<Payout>> {
    let correlation_id = correlation_id(&headers);
    respond(
        state.orders.order_payouts(&actor.actor(), &OrderId::new(order_id)).await,
        &correlation_id,
    )
}

async fn log_time(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<LogTimeRequest>,
) -> ApiResult<TimeEntry> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .time
            .log_time(&request.actor, &OrderId::new(order_id), request.entry, &correlation_id)
            .await,
        &correlation_id,
    )
}

async fn recategorize_entry(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((order_id, entry_id)): Path<(String, String)>,
    Json(request): Json<RecategorizeRequest>,
) -> ApiResult<TimeEntry> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .time
            .recategorize_entry(
                &request.actor,
                &OrderId::new(order_id),
                &TimeEntryId::new(entry_id),
                request.category,
                request.reason,
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn submit_for_approval(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<SubmitApprovalRequest>,
) -> ApiResult<ApprovalRequest> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .time
            .submit_for_approval(
                &request.actor,
                &OrderId::new(order_id),
                request.time_entry_ids,
                request.message,
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn customer_respond(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((order_id, request_id)): Path<(String, String)>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<ApprovalRequest> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .time
            .customer_respond(
                &request.actor,
                &OrderId::new(order_id),
                &ApprovalRequestId::new(request_id),
                request.decision,
                request.feedback,
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn mark_provider_completed(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<ProviderCompleteRequest>,
) -> ApiResult<Order> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .orders
            .mark_provider_completed(
                &request.actor,
                &OrderId::new(order_id),
                request.note,
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn mark_completed(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<CompleteResponse> {
    let correlation_id = correlation_id(&headers);
    let review = CompletionReview { rating: request.rating, review: request.review };
    let result = state
        .orders
        .mark_completed(&request.actor, &OrderId::new(order_id), review, &correlation_id)
        .await
        .map(|(order, payout)| CompleteResponse { order, payout });
    respond(result, &correlation_id)
}

async fn cancel_order(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<ReasonRequest>,
) -> ApiResult<Order> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .orders
            .cancel_order(&request.actor, &OrderId::new(order_id), request.reason, &correlation_id)
            .await,
        &correlation_id,
    )
}

async fn get_payout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(payout_id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<Payout> {
    let correlation_id = correlation_id(&headers);
    let actor = actor.actor();
    let result = match state.escrow.get_payout(&PayoutId::new(payout_id)).await {
        Ok(payout) if actor.is_operator() || actor.is_provider(&payout.provider_id) => Ok(payout),
        Ok(_) => Err(ApplicationError::forbidden(&actor, "read the payout")),
        Err(error) => Err(error),
    };
    respond(result, &correlation_id)
}

async fn update_payout_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(payout_id): Path<String>,
    Json(request): Json<PayoutStatusRequest>,
) -> ApiResult<Payout> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .escrow
            .update_payout_status(
                &request.actor,
                &PayoutId::new(payout_id),
                request.status,
                request.failure_reason,
                &correlation_id,
            )
            .await,
        &correlation_id,
    )
}

async fn company_balance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(company_id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<CompanyBalanceView> {
    let correlation_id = correlation_id(&headers);
    let actor = actor.actor();
    let company_id = CompanyId::new(company_id);
    let result = if actor.is_operator() || actor.is_provider(&company_id) {
        state.escrow.company_balance(&company_id).await
    } else {
        Err(ApplicationError::forbidden(&actor, "read the company balance"))
    };
    respond(result, &correlation_id)
}

async fn list_parked(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<Vec<ProcessedEvent>> {
    let correlation_id = correlation_id(&headers);
    let actor = actor.actor();
    let result = if actor.is_operator() {
        state.reconciler.list_parked().await
    } else {
        Err(ApplicationError::forbidden(&actor, "list parked payment events"))
    };
    respond(result, &correlation_id)
}

async fn replay_parked(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<EventDisposition> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .reconciler
            .replay_parked(&request.actor, &EventId::new(event_id), &correlation_id)
            .await,
        &correlation_id,
    )
}

async fn dismiss_parked(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Json(request): Json<DismissRequest>,
) -> ApiResult<ProcessedEvent> {
    let correlation_id = correlation_id(&headers);
    respond(
        state
            .reconciler
            .dismiss_parked(&request.actor, &EventId::new(event_id), request.note, &correlation_id)
            .await,
        &correlation_id,
    )
}
