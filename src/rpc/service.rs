use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;

use prost::Message;

use super::channel::RpcHandle;
use super::connection::ConnectionId;
use crate::error::{DistbuildError, Result};

/// Where an inbound request came from.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub connection: ConnectionId,
    pub request_id: u32,
    pub peer: SocketAddr,
}

/// Continuation for one inbound request.
///
/// Sending consumes the reply, so a request is answered at most once.
/// Dropping it unanswered leaves the caller's call pending until the
/// connection closes.
pub struct Reply<Resp> {
    rpc: RpcHandle,
    connection: ConnectionId,
    request_id: u32,
    service: String,
    method: String,
    _response: PhantomData<fn(Resp)>,
}

impl<Resp: Message> Reply<Resp> {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn send(self, response: Resp) {
        let sent = self.rpc.respond(
            self.connection,
            self.request_id,
            self.service,
            self.method,
            response.encode_to_vec(),
        );
        if let Err(e) = sent {
            tracing::debug!(connection = self.connection, error = %e, "Dropping reply");
        }
    }
}

type Handler = Box<dyn Fn(CallContext, &[u8], RpcHandle) -> Result<()> + Send>;

/// Maps `(service, method)` to typed handlers.
///
/// Owned by the RPC loop and only touched from it. Payloads stay opaque
/// until a handler is resolved, then decode into the handler's request type.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: HashMap<(String, String), Handler>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Req, Resp, F>(&mut self, service: &str, method: &str, handler: F)
    where
        Req: Message + Default,
        Resp: Message,
        F: Fn(CallContext, Req, Reply<Resp>) + Send + 'static,
    {
        let service_name = service.to_string();
        let method_name = method.to_string();
        let boxed: Handler = Box::new(move |ctx, payload, rpc| {
            let request = Req::decode(payload)?;
            let reply = Reply {
                rpc,
                connection: ctx.connection,
                request_id: ctx.request_id,
                service: service_name.clone(),
                method: method_name.clone(),
                _response: PhantomData,
            };
            handler(ctx, request, reply);
            Ok(())
        });
        self.handlers
            .insert((service.to_string(), method.to_string()), boxed);
    }

    pub fn unregister(&mut self, service: &str, method: &str) -> bool {
        self.handlers
            .remove(&(service.to_string(), method.to_string()))
            .is_some()
    }

    pub fn contains(&self, service: &str, method: &str) -> bool {
        self.handlers
            .contains_key(&(service.to_string(), method.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn dispatch(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        payload: &[u8],
        rpc: RpcHandle,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get(&(service.to_string(), method.to_string()))
            .ok_or_else(|| DistbuildError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            })?;
        handler(ctx, payload, rpc)
    }
}
