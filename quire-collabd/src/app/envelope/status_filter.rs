use super::validator::Envelope;
use crate::domain::connection::ConnectionStatus;
use crate::domain::operation::{Operation, OperationKind};
use crate::ports::bus::BusPayload;

/// Connection state the filters decide on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterContext {
    pub status: Option<ConnectionStatus>,
    pub pending: bool,
    pub has_uid: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OperationScope {
    TrackOnly,
    NonDocument,
    All,
}

impl OperationScope {
    fn for_context(ctx: &FilterContext) -> Self {
        match (ctx.status, ctx.pending) {
            (None, _) | (Some(ConnectionStatus::Destroy), _) => OperationScope::TrackOnly,
            (Some(_), true) => OperationScope::NonDocument,
            (Some(_), false) => OperationScope::All,
        }
    }

    fn admits(&self, operation: &Operation) -> bool {
        let kind = operation.kind();
        match self {
            OperationScope::TrackOnly => kind == OperationKind::Track,
            OperationScope::NonDocument => !kind.requires_document_access(),
            OperationScope::All => true,
        }
    }

    fn retain(&self, operations: Vec<Operation>) -> Vec<Operation> {
        operations
            .into_iter()
            .filter(|operation| self.admits(operation))
            .collect()
    }
}

/// Strips what the connection may not send in its current state.
/// `None` means nothing is left to process.
pub fn filter_inbound(ctx: FilterContext, envelope: Envelope) -> Option<Envelope> {
    match envelope {
        Envelope::KeepAlive => Some(Envelope::KeepAlive),
        Envelope::Auth(body) => {
            let stripped = ctx.has_uid || matches!(ctx.status, Some(ConnectionStatus::Destroy));
            (!stripped).then_some(Envelope::Auth(body))
        }
        Envelope::Destroy { body, auxiliary } => match ctx.status {
            None | Some(ConnectionStatus::Destroy) => None,
            Some(_) => Some(Envelope::Destroy { body, auxiliary }),
        },
        Envelope::Operations(operations) => {
            let kept = OperationScope::for_context(&ctx).retain(operations);
            (!kept.is_empty()).then_some(Envelope::Operations(kept))
        }
    }
}

/// Trims a fan-out payload before it is written to a local connection.
pub fn filter_outbound(ctx: FilterContext, payload: BusPayload) -> Option<BusPayload> {
    match (ctx.status, payload) {
        (_, BusPayload::Destroy(body)) => Some(BusPayload::Destroy(body)),
        (None, BusPayload::Auth(body)) => Some(BusPayload::Auth(body)),
        (None, BusPayload::Operations(_)) => None,
        (Some(ConnectionStatus::Destroy), BusPayload::Auth(_)) => None,
        (_, BusPayload::Auth(body)) => Some(BusPayload::Auth(body)),
        (_, BusPayload::Operations(operations)) => {
            let kept = OperationScope::for_context(&ctx).retain(operations);
            (!kept.is_empty()).then_some(BusPayload::Operations(kept))
        }
    }
}
