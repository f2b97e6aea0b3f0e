//! Remote reasoner: prompt, dispatch, validate.
//!
//! One `infer` call may dispatch several times:
//! - a transient failure is re-dispatched after an exponential backoff, up to
//!   `transient_retries` times;
//! - a reply that fails schema validation gets exactly one stricter re-prompt
//!   quoting the rejection; a second bad reply is [`OracleFault::Malformed`].
//!
//! Consecutive dispatches of the same tier are spaced at least
//! `min_interval` apart by waiting before the dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::schema::parse_response;
use super::transport::{OracleExchange, Transport};
use super::{OracleRequest, OracleResponse, Reasoner};
use crate::core::budget::{backoff_delay, spacing_wait};
use crate::core::types::Tier;
use crate::error::OracleFault;
use crate::io::config::OracleConfig;
use crate::io::prompt::PromptBuilder;
use crate::usage::UsageCounters;

pub struct RemoteReasoner {
    transport: Box<dyn Transport>,
    prompts: PromptBuilder,
    config: OracleConfig,
    usage: Arc<UsageCounters>,
    last_dispatch: Mutex<HashMap<Tier, Instant>>,
}

impl RemoteReasoner {
    pub fn new(
        transport: Box<dyn Transport>,
        config: OracleConfig,
        usage: Arc<UsageCounters>,
    ) -> Self {
        Self {
            prompts: PromptBuilder::new(config.prompt_budget_bytes),
            transport,
            config,
            usage,
            last_dispatch: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the next dispatch slot of `tier`, then wait for it outside the
    /// lock so other tiers are not held up.
    fn pace(&self, tier: Tier) {
        let min_interval = self.config.min_interval();
        let wait = {
            let mut last = self
                .last_dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let wait = spacing_wait(last.get(&tier).copied(), now, min_interval);
            last.insert(tier, now + wait);
            wait
        };
        if !wait.is_zero() {
            debug!(tier = tier.as_str(), wait_ms = wait.as_millis() as u64, "spacing oracle dispatch");
            thread::sleep(wait);
        }
    }

    fn dispatch(&self, request: &OracleRequest, rejection: Option<&str>) -> Result<String, OracleFault> {
        let stage = request.stage();
        let tier = stage.tier();
        let prompt = self
            .prompts
            .build(request, rejection)
            .map_err(|e| OracleFault::Unavailable(format!("{e:#}")))?;
        let exchange = OracleExchange {
            stage,
            tier,
            model: self.config.model_for(tier).map(str::to_string),
            prompt,
            timeout: self.config.timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };

        let mut retries = 0;
        loop {
            self.pace(tier);
            self.usage.record_call(tier);
            match self.transport.exchange(&exchange) {
                Err(OracleFault::Transient(reason)) if retries < self.config.transient_retries => {
                    let delay = backoff_delay(self.config.backoff_base(), retries);
                    retries += 1;
                    self.usage.record_retry();
                    warn!(
                        %reason,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient oracle failure, backing off"
                    );
                    sleep(delay);
                }
                other => return other,
            }
        }
    }
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

impl Reasoner for RemoteReasoner {
    fn name(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip_all, fields(stage = request.stage().as_str()))]
    fn infer(&self, request: &OracleRequest) -> Result<OracleResponse, OracleFault> {
        let stage = request.stage();
        let reply = self.dispatch(request, None)?;
        let rejection = match parse_response(stage, &reply) {
            Ok(response) => return Ok(response),
            Err(rejection) => rejection,
        };

        info!(%rejection, "oracle reply rejected, re-prompting strictly");
        self.usage.record_reprompt();
        let reply = self.dispatch(request, Some(&rejection))?;
        parse_response(stage, &reply).map_err(|second| {
            warn!(rejection = %second, "strict re-prompt also rejected");
            OracleFault::Malformed(second)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Stage;
    use crate::io::oracle::IntentRequest;
    use crate::test_support::{ScriptedReply, ScriptedTransport};

    const INTENT_OK: &str = r#"{"intent":"list files","constraints":[],"suggested_tools":["shell"],"confidence":0.9,"clarification_questions":[]}"#;

    fn config() -> OracleConfig {
        OracleConfig {
            command: vec!["scripted".to_string()],
            backoff_base_ms: 0,
            ..OracleConfig::default()
        }
    }

    fn intent_request() -> OracleRequest {
        OracleRequest::Intent(IntentRequest {
            raw_input: "list files".to_string(),
            confidence_threshold: 0.7,
        })
    }

    fn reasoner(transport: ScriptedTransport, usage: &Arc<UsageCounters>) -> RemoteReasoner {
        RemoteReasoner::new(Box::new(transport), config(), usage.clone())
    }

    #[test]
    fn valid_reply_is_one_call() {
        let transport = ScriptedTransport::new().with(Stage::Intent, [ScriptedReply::text(INTENT_OK)]);
        let calls = transport.calls();
        let usage = Arc::new(UsageCounters::new());
        let response = reasoner(transport, &usage)
            .infer(&intent_request())
            .expect("valid");
        assert!(matches!(response, OracleResponse::Intent(ref a) if a.intent == "list files"));
        assert_eq!(calls.count(Stage::Intent), 1);
        assert_eq!(usage.snapshot().cheap_calls, 1);
    }

    #[test]
    fn malformed_reply_gets_one_strict_reprompt() {
        let transport = ScriptedTransport::new().with(
            Stage::Intent,
            [ScriptedReply::text("sure thing"), ScriptedReply::text(INTENT_OK)],
        );
        let calls = transport.calls();
        let usage = Arc::new(UsageCounters::new());
        reasoner(transport, &usage)
            .infer(&intent_request())
            .expect("second reply valid");
        assert_eq!(calls.count(Stage::Intent), 2);
        assert!(calls.prompts(Stage::Intent)[1].contains("Previous Reply Rejected"));
        assert_eq!(usage.snapshot().reprompts, 1);
    }

    #[test]
    fn second_malformed_reply_is_a_fault() {
        let transport =
            ScriptedTransport::new().with(Stage::Intent, [ScriptedReply::text("{\"intent\":1}")]);
        let calls = transport.calls();
        let usage = Arc::new(UsageCounters::new());
        let err = reasoner(transport, &usage)
            .infer(&intent_request())
            .expect_err("malformed twice");
        assert!(matches!(err, OracleFault::Malformed(_)));
        assert_eq!(calls.count(Stage::Intent), 2);
    }

    #[test]
    fn transient_failures_retry_up_to_the_cap() {
        let transport = ScriptedTransport::new().with(
            Stage::Intent,
            [ScriptedReply::Fault(OracleFault::Transient("429".to_string()))],
        );
        let calls = transport.calls();
        let usage = Arc::new(UsageCounters::new());
        let err = reasoner(transport, &usage)
            .infer(&intent_request())
            .expect_err("always transient");
        assert!(matches!(err, OracleFault::Transient(_)));
        assert_eq!(calls.count(Stage::Intent), 4);
        assert_eq!(usage.snapshot().retries, 3);
    }

    #[test]
    fn transient_then_success_recovers() {
        let transport = ScriptedTransport::new().with(
            Stage::Intent,
            [
                ScriptedReply::Fault(OracleFault::Transient("timeout".to_string())),
                ScriptedReply::text(INTENT_OK),
            ],
        );
        let usage = Arc::new(UsageCounters::new());
        assert!(reasoner(transport, &usage).infer(&intent_request()).is_ok());
        assert_eq!(usage.snapshot().retries, 1);
    }

    #[test]
    fn unavailable_is_not_retried() {
        let transport = ScriptedTransport::new().with(
            Stage::Intent,
            [ScriptedReply::Fault(OracleFault::Unavailable("gone".to_string()))],
        );
        let calls = transport.calls();
        let usage = Arc::new(UsageCounters::new());
        let err = reasoner(transport, &usage)
            .infer(&intent_request())
            .expect_err("unavailable");
        assert!(matches!(err, OracleFault::Unavailable(_)));
        assert_eq!(calls.count(Stage::Intent), 1);
    }

    #[test]
    fn dispatches_of_one_tier_are_spaced() {
        let transport = ScriptedTransport::new().with(Stage::Intent, [ScriptedReply::text(INTENT_OK)]);
        let usage = Arc::new(UsageCounters::new());
        let reasoner = RemoteReasoner::new(
            Box::new(transport),
            OracleConfig {
                min_interval_ms: 150,
                ..config()
            },
            usage,
        );
        let started = Instant::now();
        reasoner.infer(&intent_request()).expect("first");
        reasoner.infer(&intent_request()).expect("second");
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn waiting_on_one_tier_does_not_hold_up_another() {
        let usage = Arc::new(UsageCounters::new());
        let reasoner = RemoteReasoner::new(
            Box::new(ScriptedTransport::new()),
            OracleConfig {
                min_interval_ms: 400,
                ..config()
            },
            usage,
        );
        reasoner.pace(Tier::Cheap);

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let started = Instant::now();
                reasoner.pace(Tier::Cheap);
                started.elapsed()
            });
            std::thread::sleep(Duration::from_millis(50));
            let started = Instant::now();
            reasoner.pace(Tier::Premium);
            assert!(started.elapsed() < Duration::from_millis(200));
            let waited = waiter.join().expect("cheap waiter");
            assert!(waited >= Duration::from_millis(300));
        });
    }

    #[test]
    fn concurrent_callers_of_one_tier_get_successive_slots() {
        let usage = Arc::new(UsageCounters::new());
        let reasoner = RemoteReasoner::new(
            Box::new(ScriptedTransport::new()),
            OracleConfig {
                min_interval_ms: 100,
                ..config()
            },
            usage,
        );
        let started = Instant::now();
        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| reasoner.pace(Tier::Standard));
            }
        });
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
