use crate::bindings;
use crate::pool::VmPool;
use crate::types::{ScriptRequest, ScriptResponse};
use futures_util::future::BoxFuture;
use mlua::{Function, Lua, Table, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Facade over the interpreter pool: runs a route's scripted chain,
/// middleware in declared order and then the terminal handler.
///
/// One instance is acquired per scripted request-phase and the whole chain
/// executes inside it; `next` continues on the same VM, so a route's chain
/// can never deadlock the pool regardless of its depth or the pool size.
/// The acquisition guard is held across the chain and released on every
/// exit path, including script failures and request-deadline cancellation.
pub struct ScriptEngine {
    pool: Arc<VmPool>,
}

impl ScriptEngine {
    pub fn new(pool: Arc<VmPool>) -> Self {
        Self { pool }
    }

    /// Run `middleware` in order, then `handler`. All failures are
    /// translated locally: the return value is always a writable response.
    pub async fn execute(
        &self,
        middleware: &[String],
        handler: &str,
        request: ScriptRequest,
    ) -> ScriptResponse {
        let request = Arc::new(request);
        let guard = self.pool.acquire().await;
        let lua = guard.vm().clone();

        let request_table = match bindings::build_request_table(&lua, &request) {
            Ok(table) => table,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Failed to marshal request");
                return ScriptResponse::internal_error();
            }
        };

        let names: Arc<[String]> = middleware.to_vec().into();
        let handler: Arc<str> = Arc::from(handler);
        let response = chain_step(lua, request_table, names, 0, handler, request).await;
        drop(guard);
        response
    }

    /// Run a bare handler with no middleware.
    pub async fn execute_handler(&self, handler: &str, request: ScriptRequest) -> ScriptResponse {
        self.execute(&[], handler, request).await
    }
}

/// One step of the chain: middleware at `index`, or the handler once the
/// middleware list is exhausted. Boxed for recursion through the `next`
/// continuation.
fn chain_step(
    lua: Lua,
    request_table: Table,
    names: Arc<[String]>,
    index: usize,
    handler: Arc<str>,
    request: Arc<ScriptRequest>,
) -> BoxFuture<'static, ScriptResponse> {
    Box::pin(async move {
        if index == names.len() {
            return call_handler(&lua, &handler, request_table, &request).await;
        }

        let name = names[index].clone();
        let func: Function = match lua.globals().get(name.as_str()) {
            Ok(f) => f,
            Err(e) => {
                warn!(script = %name, error = %e, "Middleware symbol did not resolve");
                return ScriptResponse::internal_error();
            }
        };

        // Single-use continuation over the remaining chain. The downstream
        // response lands in a slot the middleware frame reads after the
        // script returns.
        let invoked = Arc::new(AtomicBool::new(false));
        let downstream: Arc<Mutex<Option<ScriptResponse>>> = Arc::new(Mutex::new(None));

        let next_fn = {
            let request_table = request_table.clone();
            let names = Arc::clone(&names);
            let handler = Arc::clone(&handler);
            let request = Arc::clone(&request);
            let invoked = Arc::clone(&invoked);
            let downstream = Arc::clone(&downstream);
            let script = name.clone();

            // The VM handle comes from the call itself rather than a
            // capture, so the function holds no cycle back into the VM.
            lua.create_async_function(move |lua, ()| {
                let request_table = request_table.clone();
                let names = Arc::clone(&names);
                let handler = Arc::clone(&handler);
                let request = Arc::clone(&request);
                let invoked = Arc::clone(&invoked);
                let downstream = Arc::clone(&downstream);
                let script = script.clone();

                async move {
                    if invoked.swap(true, Ordering::SeqCst) {
                        warn!(script = %script, "next() invoked more than once; ignoring");
                        return Ok(());
                    }
                    let response =
                        chain_step(lua, request_table, names, index + 1, handler, request).await;
                    *downstream.lock().expect("downstream slot lock poisoned") = Some(response);
                    Ok(())
                }
            })
        };

        let next_fn = match next_fn {
            Ok(f) => f,
            Err(e) => {
                warn!(script = %name, error = %e, "Failed to build continuation");
                return ScriptResponse::internal_error();
            }
        };

        match func.call_async::<Value>((request_table, next_fn)).await {
            Ok(value) => {
                let ran = downstream
                    .lock()
                    .expect("downstream slot lock poisoned")
                    .take();
                if let Some(response) = ran {
                    // The chain ran to completion; whatever the middleware
                    // returned afterwards is ignored.
                    return response;
                }
                if let Some(response) = bindings::read_response_table(&value) {
                    return response;
                }
                match value {
                    Value::Nil => ScriptResponse::no_content(),
                    _ => {
                        warn!(script = %name, "Middleware returned a non-table value");
                        ScriptResponse::internal_error()
                    }
                }
            }
            Err(e) => {
                warn!(
                    script = %name,
                    request_id = %request.request_id,
                    error = %e,
                    "Middleware execution failed"
                );
                ScriptResponse::internal_error()
            }
        }
    })
}

async fn call_handler(
    lua: &Lua,
    name: &str,
    request_table: Table,
    request: &ScriptRequest,
) -> ScriptResponse {
    let func: Function = match lua.globals().get(name) {
        Ok(f) => f,
        Err(e) => {
            warn!(script = %name, error = %e, "Handler symbol did not resolve");
            return ScriptResponse::internal_error();
        }
    };

    match func.call_async::<Value>(request_table).await {
        Ok(value) => match bindings::read_response_table(&value) {
            Some(response) => response,
            None => {
                warn!(script = %name, request_id = %request.request_id, "Handler returned a non-table value");
                ScriptResponse::internal_error()
            }
        },
        Err(e) => {
            warn!(
                script = %name,
                request_id = %request.request_id,
                error = %e,
                "Handler execution failed"
            );
            ScriptResponse::internal_error()
        }
    }
}
