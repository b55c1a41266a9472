//! One isolated extension context.
//!
//! Each instance gets its own Rhai engine, scope and AST with the sandbox
//! limits from the config. The script is wrapped in a small prelude that
//! defines the `log` namespace; error positions are mapped back past it.
//!
//! Scripts subscribe during their top-level run; afterwards the sandbox only
//! runs when the shell dispatches an event or delivers a message.

use std::cell::RefCell;
use std::rc::Rc;

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Scope, AST};

use crate::capability::ExtensionKind;
use crate::config::BridgeConfig;
use crate::diagnostics::{
    from_eval_error, from_parse_error, DiagnosticLog, DiagnosticPhase, ExtensionDiagnostic,
};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{BridgeEvent, EventHub};
use crate::extension_log::{ExtensionLogger, LogLevel};
use crate::marshal::to_script;
use crate::registry::RoutedMessage;
use crate::surface_rhai::{build_api_map, register_surface_api, HandlerHub, SurfaceLink};

const PRELUDE: &str = r#"
// === Log namespace ===
let log = #{};
log.info = |msg| { __log_info(msg); };
log.warn = |msg| { __log_warn(msg); };
log.error = |msg| { __log_error(msg); };

// === Extension source ===
"#;

pub struct ExtensionSandbox {
    instance_id: String,
    kind: ExtensionKind,
    engine: Engine,
    scope: Scope<'static>,
    ast: Option<AST>,
    hub: HandlerHub,
    link: Rc<SurfaceLink>,
    logger: Rc<ExtensionLogger>,
    diagnostics: DiagnosticLog,
    /// Number of prelude lines before the extension source.
    user_line_offset: usize,
    version: String,
    api_version: u32,
}

impl ExtensionSandbox {
    pub fn new(
        extension_id: &str,
        kind: ExtensionKind,
        link: Rc<SurfaceLink>,
        config: &BridgeConfig,
    ) -> Self {
        let instance_id = link.instance_id().to_string();
        let mut engine = Engine::new();
        config.sandbox.apply(&mut engine);

        let logger = Rc::new(ExtensionLogger::new(
            extension_id,
            &instance_id,
            config.max_logs_per_tick,
        ));
        for (name, level) in [
            ("__log_info", LogLevel::Info),
            ("__log_warn", LogLevel::Warn),
            ("__log_error", LogLevel::Error),
        ] {
            let logger = Rc::clone(&logger);
            engine.register_fn(name, move |value: Dynamic| {
                logger.log(level, &value);
            });
        }

        let hub: HandlerHub = Rc::new(RefCell::new(EventHub::new()));
        register_surface_api(&mut engine, &link, &hub);

        Self {
            instance_id,
            kind,
            engine,
            scope: Scope::new(),
            ast: None,
            hub,
            link,
            logger,
            diagnostics: DiagnosticLog::new(config.max_diagnostics),
            user_line_offset: PRELUDE.matches('\n').count(),
            version: config.version.clone(),
            api_version: config.api_version,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn link(&self) -> &Rc<SurfaceLink> {
        &self.link
    }

    pub fn logger(&self) -> &Rc<ExtensionLogger> {
        &self.logger
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn listener_count(&self) -> usize {
        self.hub.borrow().listener_count()
    }

    pub fn is_loaded(&self) -> bool {
        self.ast.is_some()
    }

    fn push_diagnostic(&mut self, diagnostic: ExtensionDiagnostic) {
        log::warn!("[{}] {}", self.instance_id, diagnostic.message);
        self.diagnostics.push(diagnostic);
    }

    /// Record values the last call tried to hand over but could not.
    fn collect_refusals(&mut self, phase: DiagnosticPhase) {
        for err in self.link.take_refusals() {
            let diagnostic = ExtensionDiagnostic::from_bridge_error(&self.instance_id, phase, &err);
            self.push_diagnostic(diagnostic);
        }
    }

    /// Compile and run `source` from a fresh scope. Subscriptions from any
    /// previous run are dropped first.
    pub fn load(&mut self, source: &str) -> BridgeResult<()> {
        *self.hub.borrow_mut() = EventHub::new();
        self.ast = None;
        self.scope = Scope::new();
        self.scope.push(
            "api",
            build_api_map(&self.link, self.kind, &self.version, self.api_version),
        );

        let full_script = format!("{PRELUDE}{source}");
        let ast = match self.engine.compile(&full_script) {
            Ok(ast) => ast,
            Err(err) => {
                let diagnostic = from_parse_error(&self.instance_id, &err, self.user_line_offset);
                let message = diagnostic.message.clone();
                self.push_diagnostic(diagnostic);
                return Err(BridgeError::Compile {
                    instance: self.instance_id.clone(),
                    message,
                });
            }
        };

        let result = self.engine.run_ast_with_scope(&mut self.scope, &ast);
        self.collect_refusals(DiagnosticPhase::Load);
        if let Err(err) = result {
            let diagnostic = from_eval_error(
                &self.instance_id,
                DiagnosticPhase::Load,
                &err,
                self.user_line_offset,
            );
            let message = diagnostic.message.clone();
            self.push_diagnostic(diagnostic);
            return Err(BridgeError::Script {
                instance: self.instance_id.clone(),
                message,
            });
        }

        log::info!(
            "[{}] loaded, {} listener(s)",
            self.instance_id,
            self.listener_count()
        );
        self.ast = Some(ast);
        Ok(())
    }

    /// Call every handler subscribed to `event`. Handler failures are
    /// recorded and do not stop the remaining handlers. Returns the first
    /// failure, if any.
    pub fn dispatch(&mut self, event: &BridgeEvent) -> BridgeResult<()> {
        self.dispatch_in(event, DiagnosticPhase::Event)
    }

    /// Deliver a routed message as a `message` event; handlers receive the
    /// payload and the sender id.
    pub fn receive(&mut self, message: &RoutedMessage) -> BridgeResult<()> {
        let event = BridgeEvent::Message {
            sender: message.sender.clone(),
            payload: message.payload.clone(),
        };
        self.dispatch_in(&event, DiagnosticPhase::Message)
    }

    fn dispatch_in(&mut self, event: &BridgeEvent, phase: DiagnosticPhase) -> BridgeResult<()> {
        let Some(ast) = self.ast.clone() else {
            return Ok(());
        };
        // Take handlers before calling so handlers may (un)subscribe.
        let handlers = self.hub.borrow_mut().take_for(event.name());
        if handlers.is_empty() {
            return Ok(());
        }

        let mut args: Vec<Dynamic> = Vec::new();
        if let Some(payload) = event.payload() {
            args.push(to_script(&payload));
        }
        if let BridgeEvent::Message { sender, .. } = event {
            args.push(Dynamic::from(sender.clone()));
        }

        let mut first_error = None;
        for handler in handlers {
            let result = call_handler(&self.engine, &ast, &handler, &args);
            self.collect_refusals(phase);
            if let Err(err) = result {
                let diagnostic =
                    from_eval_error(&self.instance_id, phase, &err, self.user_line_offset);
                let message = format!("`{}` handler failed: {}", event.name(), diagnostic.message);
                self.push_diagnostic(diagnostic);
                first_error.get_or_insert(BridgeError::Script {
                    instance: self.instance_id.clone(),
                    message,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deliver `close` and drop every subscription. Nothing reaches the
    /// script afterwards.
    pub fn close(&mut self) {
        if let Err(err) = self.dispatch(&BridgeEvent::Close) {
            log::debug!("[{}] close handler failed: {err}", self.instance_id);
        }
        self.hub.borrow_mut().close();
    }

    pub fn is_closed(&self) -> bool {
        self.hub.borrow().is_closed()
    }
}

/// Call `handler` with as many of `args` as it accepts.
fn call_handler(
    engine: &Engine,
    ast: &AST,
    handler: &FnPtr,
    args: &[Dynamic],
) -> Result<Dynamic, Box<EvalAltResult>> {
    let mut arity = args.len();
    loop {
        let result = match arity {
            0 => handler.call::<Dynamic>(engine, ast, ()),
            1 => handler.call::<Dynamic>(engine, ast, (args[0].clone(),)),
            _ => handler.call::<Dynamic>(engine, ast, (args[0].clone(), args[1].clone())),
        };
        match result {
            Err(err) if arity > 0 && is_arity_mismatch(&err, handler) => arity -= 1,
            other => return other,
        }
    }
}

fn is_arity_mismatch(err: &EvalAltResult, handler: &FnPtr) -> bool {
    matches!(err, EvalAltResult::ErrorFunctionNotFound(signature, _)
        if signature.starts_with(handler.fn_name()))
}
