//! The response dispatcher: try candidate mocks in priority order until one
//! handles the request.
//!
//! Candidates arrive grouped by location, least specific first; iteration
//! runs leaf-first so the most specific location wins, while registry
//! priority order is preserved within each location. Each mock value is
//! interpreted by an ordered chain of rules - sequence, handler, descriptor,
//! literal - where every rule either handles the request or passes to the
//! next.

use tracing::debug;

use crate::matcher::{request_matches, MockRequest};
use crate::mock::{HandlerArgs, HandlerVerdict, MockValue};
use crate::render::{render, render_literal, Rendered};
use crate::resolve::CandidateGroup;

/// Try every candidate for this request; `None` means nothing handled it.
///
/// Honors `timeToRespond`: the winning response is held back for that long
/// before being returned, without blocking other requests.
pub async fn respond_with_mocks(
    request: &MockRequest,
    groups: &[CandidateGroup],
) -> Option<Rendered> {
    for group in groups.iter().rev() {
        for value in &group.mocks {
            if let Some(rendered) = try_mock(request, value, &group.location) {
                if !rendered.delay.is_zero() {
                    tokio::time::sleep(rendered.delay).await;
                }
                return Some(rendered);
            }
        }
    }
    None
}

/// Apply the interpretation rules to one mock value.
///
/// Handler panics are deliberately not caught here: the server has already
/// emitted `mock-start` for this request, so the fault stays attributable.
fn try_mock(request: &MockRequest, value: &MockValue, location: &str) -> Option<Rendered> {
    match value {
        MockValue::Sequence(items) => items
            .iter()
            .find_map(|item| try_mock(request, item, location)),

        MockValue::Handler(handler) => {
            let verdict = handler(HandlerArgs {
                url: &request.url,
                location,
                request,
            });
            match verdict {
                HandlerVerdict::Next => None,
                HandlerVerdict::Respond(spec) => match render(&spec) {
                    Ok(rendered) => Some(rendered),
                    Err(err) => {
                        debug!(location, %err, "handler response failed to render; skipping");
                        None
                    }
                },
            }
        }

        MockValue::Descriptor(descriptor) => {
            // Descriptors apply only at their own location, never for a
            // descendant request path.
            if location != request.path {
                return None;
            }
            if let Some(predicate) = &descriptor.request {
                if !request_matches(predicate, request) {
                    return None;
                }
            }
            match render(&descriptor.response) {
                Ok(rendered) => Some(rendered),
                Err(err) => {
                    debug!(location, %err, "descriptor failed to render; skipping");
                    None
                }
            }
        }

        MockValue::Literal(data) => {
            if location != request.path {
                return None;
            }
            match render_literal(data) {
                Ok(rendered) => Some(rendered),
                Err(err) => {
                    debug!(location, %err, "literal mock failed to serialize; skipping");
                    None
                }
            }
        }
    }
}
