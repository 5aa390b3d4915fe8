use mavrelay_frame::DecodedFrame;

use crate::mainloop::EndpointId;

/// Decides where a received frame goes.
pub trait RoutingPolicy {
    /// Push the endpoints that should receive `frame` onto `targets`.
    ///
    /// `endpoints` lists every live endpoint, `source` included.
    fn route(
        &mut self,
        source: EndpointId,
        frame: &DecodedFrame,
        endpoints: &[EndpointId],
        targets: &mut Vec<EndpointId>,
    );
}

/// Forward every frame to every endpoint except the one it came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct Broadcast;

impl RoutingPolicy for Broadcast {
    fn route(
        &mut self,
        source: EndpointId,
        _frame: &DecodedFrame,
        endpoints: &[EndpointId],
        targets: &mut Vec<EndpointId>,
    ) {
        targets.extend(endpoints.iter().copied().filter(|&id| id != source));
    }
}

impl<F> RoutingPolicy for F
where
    F: FnMut(EndpointId, &DecodedFrame, &[EndpointId], &mut Vec<EndpointId>),
{
    fn route(
        &mut self,
        source: EndpointId,
        frame: &DecodedFrame,
        endpoints: &[EndpointId],
        targets: &mut Vec<EndpointId>,
    ) {
        self(source, frame, endpoints, targets)
    }
}
