//! Tunnel State Machine
//!
//! Owns the current [`TunnelState`] and the single connection attempt. Every
//! input is handled synchronously and returns the states entered, in order;
//! each entered state becomes exactly one `DaemonEvent::TunnelState`.
//!
//! # Transitions
//!
//! | From | Input | To |
//! |------|-------|----|
//! | Disconnected, Error | Connect | Connecting |
//! | Connecting | backend up | Connected |
//! | Connecting | transient failure or timeout | Connecting (next attempt) |
//! | Connecting | failure, attempts exhausted or policy cause | Error |
//! | Connected | backend down or transient failure | Connecting (fresh attempts) |
//! | Connecting, Connected | Disconnect | Disconnecting |
//! | Disconnecting | backend down | Disconnected or Connecting |
//! | Error | Disconnect | Disconnecting, Disconnected |
//! | Connecting, Connected | Reconnect, settings or key change | Disconnecting, Connecting |
//!
//! The backend is only ever told to start or abort; it reports back through
//! the events channel and the daemon feeds those reports in as
//! [`TunnelInput::Backend`]. Reports for anything but the current attempt
//! are dropped, so an aborted attempt can never reach `Connected`.

use crate::backend::{
    AttemptFailure, AttemptHandle, AttemptId, BackendEvent, BackendEventSender, BackendMessage,
    TunnelBackend, TunnelMetadata,
};
use fos_vpn::device::{DeviceEventCause, DeviceState};
use fos_vpn::firewall::{AllowedEndpoint, Firewall, FirewallPolicy};
use fos_vpn::relay_list::RelayList;
use fos_vpn::selector::{ConnectionPlan, RelaySelector, SelectorQuery};
use fos_vpn::settings::Settings;
use fos_vpn::states::{
    ActionAfterDisconnect, ErrorState, ErrorStateCause, GeoIpLocation, ParameterGenerationError,
    TunnelState, TunnelStateRelayInfo,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Bounds on connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per connect before entering the error state
    pub max_attempts: u32,
    /// Time an attempt may spend connecting
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TunnelInput {
    Connect,
    Disconnect,
    Reconnect,
    /// Settings were committed; the context holds the new ones
    SettingsChanged { old: Settings },
    DeviceChanged(DeviceEventCause),
    Backend(BackendMessage),
    AttemptTimeout(AttemptId),
}

/// Read-only daemon state an input is handled against
#[derive(Debug, Clone, Copy)]
pub struct TunnelContext<'a> {
    pub settings: &'a Settings,
    pub relay_list: &'a RelayList,
    pub device: &'a DeviceState,
}

struct Attempt {
    handle: AttemptHandle,
    plan: ConnectionPlan,
    deadline: Instant,
}

/// Aborted attempt whose `Down` we are waiting for
struct Teardown {
    id: AttemptId,
    deadline: Instant,
}

pub struct TunnelStateMachine<B, F> {
    state: TunnelState,
    backend: B,
    firewall: F,
    policy: RetryPolicy,
    rng: StdRng,
    events: BackendEventSender,
    attempt: Option<Attempt>,
    teardown: Option<Teardown>,
    next_id: AttemptId,
    /// Attempts made since the last fresh connect, drives the fallback order
    attempt_index: u32,
    last_location: Option<GeoIpLocation>,
}

impl<B: TunnelBackend, F: Firewall> TunnelStateMachine<B, F> {
    /// Start out disconnected, locked down if `settings` ask for it
    pub fn new(
        backend: B,
        firewall: F,
        policy: RetryPolicy,
        events: BackendEventSender,
        settings: &Settings,
    ) -> Self {
        let mut machine = Self {
            state: TunnelState::disconnected(settings.block_when_disconnected),
            backend,
            firewall,
            policy,
            rng: StdRng::from_entropy(),
            events,
            attempt: None,
            teardown: None,
            next_id: AttemptId::new(1),
            attempt_index: 0,
            last_location: None,
        };
        machine.apply_disconnected_policy(settings.block_when_disconnected, settings.allow_lan);
        machine
    }

    /// Make relay selection reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    pub fn firewall(&self) -> &F {
        &self.firewall
    }

    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.attempt.as_ref().map(|attempt| attempt.handle.id())
    }

    /// When the pending attempt or teardown times out
    pub fn deadline(&self) -> Option<(AttemptId, Instant)> {
        if let Some(teardown) = &self.teardown {
            return Some((teardown.id, teardown.deadline));
        }
        match (&self.state, &self.attempt) {
            (TunnelState::Connecting { .. }, Some(attempt)) => {
                Some((attempt.handle.id(), attempt.deadline))
            }
            _ => None,
        }
    }

    pub fn handle(&mut self, input: TunnelInput, ctx: &TunnelContext<'_>) -> Vec<TunnelState> {
        let mut entered = Vec::new();
        match input {
            TunnelInput::Connect => self.on_connect(ctx, &mut entered),
            TunnelInput::Disconnect => self.on_disconnect(ctx, &mut entered),
            TunnelInput::Reconnect => self.on_reconnect(ctx, &mut entered),
            TunnelInput::SettingsChanged { old } => self.on_settings_changed(&old, ctx, &mut entered),
            TunnelInput::DeviceChanged(cause) => self.on_device_changed(cause, ctx, &mut entered),
            TunnelInput::Backend(message) => self.on_backend(message, ctx, &mut entered),
            TunnelInput::AttemptTimeout(id) => self.on_timeout(id, ctx, &mut entered),
        }
        entered
    }

    fn on_connect(&mut self, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        match &self.state {
            TunnelState::Disconnected { .. } | TunnelState::Error { .. } => {
                self.attempt_index = 0;
                self.connect(ctx, out);
            }
            TunnelState::Disconnecting { after_disconnect } => {
                if *after_disconnect != ActionAfterDisconnect::Reconnect {
                    self.enter(
                        TunnelState::Disconnecting {
                            after_disconnect: ActionAfterDisconnect::Reconnect,
                        },
                        out,
                    );
                }
            }
            TunnelState::Connecting { .. } | TunnelState::Connected { .. } => {
                debug!("Connect ignored, tunnel is {}", self.state);
            }
        }
    }

    fn on_disconnect(&mut self, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        let after = if ctx.settings.block_when_disconnected {
            ActionAfterDisconnect::Block
        } else {
            ActionAfterDisconnect::Nothing
        };
        match &self.state {
            TunnelState::Connecting { .. } | TunnelState::Connected { .. } => {
                self.begin_teardown(after, ctx, out);
            }
            TunnelState::Disconnecting { after_disconnect } => {
                if *after_disconnect == ActionAfterDisconnect::Reconnect {
                    self.enter(TunnelState::Disconnecting { after_disconnect: after }, out);
                }
            }
            TunnelState::Error { .. } => {
                self.enter_disconnecting(ActionAfterDisconnect::Nothing, ctx, out);
                self.finish_disconnect(ctx, out);
            }
            TunnelState::Disconnected { .. } => debug!("Already disconnected"),
        }
    }

    fn on_reconnect(&mut self, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        match &self.state {
            TunnelState::Connecting { .. } | TunnelState::Connected { .. } => {
                self.begin_teardown(ActionAfterDisconnect::Reconnect, ctx, out);
            }
            TunnelState::Error { .. } => {
                self.attempt_index = 0;
                self.connect(ctx, out);
            }
            TunnelState::Disconnected { .. } | TunnelState::Disconnecting { .. } => {
                debug!("Reconnect ignored, tunnel is {}", self.state);
            }
        }
    }

    fn on_settings_changed(
        &mut self,
        old: &Settings,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        let new = ctx.settings;
        let reconnect = Settings::requires_reconnect(old, new);
        let lan_changed = old.allow_lan != new.allow_lan;

        match &self.state {
            TunnelState::Connecting { .. } | TunnelState::Connected { .. } => {
                if reconnect {
                    info!("Settings changed, reconnecting");
                    self.begin_teardown(ActionAfterDisconnect::Reconnect, ctx, out);
                } else if lan_changed {
                    self.reapply_policy(ctx, out);
                }
            }
            TunnelState::Disconnected { locked_down, .. } => {
                if old.block_when_disconnected != new.block_when_disconnected {
                    self.enter_disconnected(new.block_when_disconnected, ctx, out);
                } else if lan_changed && *locked_down {
                    self.reapply_policy(ctx, out);
                }
            }
            TunnelState::Error { .. } => {
                if reconnect {
                    info!("Settings changed, retrying");
                    self.attempt_index = 0;
                    self.connect(ctx, out);
                } else if lan_changed {
                    self.reapply_policy(ctx, out);
                }
            }
            TunnelState::Disconnecting { .. } => {
                if lan_changed {
                    self.reapply_policy(ctx, out);
                }
            }
        }
    }

    fn on_device_changed(
        &mut self,
        cause: DeviceEventCause,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        if !cause.changes_key() || !self.state.is_active() {
            return;
        }
        let uses_device_key = matches!(
            self.attempt.as_ref().map(|attempt| &attempt.plan),
            Some(ConnectionPlan::Wireguard(_))
        );
        if uses_device_key {
            info!("WireGuard key changed ({:?}), reconnecting", cause);
            self.begin_teardown(ActionAfterDisconnect::Reconnect, ctx, out);
        }
    }

    fn on_backend(
        &mut self,
        message: BackendMessage,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        if self
            .teardown
            .as_ref()
            .is_some_and(|teardown| teardown.id == message.attempt)
        {
            if message.event == BackendEvent::Down {
                debug!("Attempt {} is down", message.attempt);
                self.finish_disconnect(ctx, out);
            }
            return;
        }

        if self.current_attempt() != Some(message.attempt) {
            debug!("Dropping event from stale attempt {}", message.attempt);
            return;
        }

        match message.event {
            BackendEvent::Resolved(address) => self.on_resolved(address, ctx, out),
            BackendEvent::Up(metadata) => self.on_tunnel_up(metadata, ctx, out),
            BackendEvent::Down => self.on_attempt_failed(
                AttemptFailure::Transient(ErrorStateCause::StartTunnelError),
                ctx,
                out,
            ),
            BackendEvent::Failed(failure) => self.on_attempt_failed(failure, ctx, out),
        }
    }

    fn on_timeout(&mut self, id: AttemptId, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        if self.teardown.as_ref().is_some_and(|teardown| teardown.id == id) {
            warn!("Attempt {} did not report down in time", id);
            self.finish_disconnect(ctx, out);
            return;
        }
        if !self.state.is_connecting() || self.current_attempt() != Some(id) {
            return;
        }
        warn!("Attempt {} timed out", id);
        if let Some(attempt) = self.attempt.take() {
            self.backend.abort(attempt.handle);
        }
        self.on_attempt_failed(
            AttemptFailure::Transient(ErrorStateCause::StartTunnelError),
            ctx,
            out,
        );
    }

    /// Open the firewall for a custom host once its address is known
    fn on_resolved(
        &mut self,
        address: SocketAddr,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        if !self.state.is_connecting() {
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let ConnectionPlan::Custom(custom) = &mut attempt.plan else {
            debug!("Ignoring resolved address for a relay attempt");
            return;
        };
        custom.address = Some(address);
        let Some(peer_endpoint) = attempt.plan.allowed_endpoint() else {
            return;
        };

        debug!("Custom endpoint resolved to {}", address);
        let policy = FirewallPolicy::Connecting {
            peer_endpoint,
            allow_lan: ctx.settings.allow_lan,
        };
        if let Err(error) = self.firewall.apply_policy(policy) {
            self.enter_error(ErrorStateCause::SetFirewallPolicyError { error }, ctx, out);
        }
    }

    fn on_tunnel_up(
        &mut self,
        metadata: TunnelMetadata,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        if !self.state.is_connecting() {
            return;
        }
        let Some(plan) = self.attempt.as_ref().map(|attempt| attempt.plan.clone()) else {
            return;
        };

        let relay_info = match metadata.endpoint {
            Some(tunnel_endpoint) => Some(TunnelStateRelayInfo {
                tunnel_endpoint,
                location: plan.location(),
            }),
            None => plan.relay_info(),
        };
        let Some(relay_info) = relay_info else {
            warn!("Tunnel came up without a known endpoint");
            self.on_attempt_failed(
                AttemptFailure::Transient(ErrorStateCause::StartTunnelError),
                ctx,
                out,
            );
            return;
        };

        let (address, protocol) = relay_info.tunnel_endpoint.first_hop();
        let policy = FirewallPolicy::Connected {
            peer_endpoint: AllowedEndpoint { address, protocol },
            allow_lan: ctx.settings.allow_lan,
        };
        if let Err(error) = self.firewall.apply_policy(policy) {
            self.enter_error(ErrorStateCause::SetFirewallPolicyError { error }, ctx, out);
            return;
        }

        info!("Tunnel up on {}", metadata.interface);
        self.last_location = relay_info.location.clone();
        self.enter(
            TunnelState::Connected {
                relay_info,
                feature_indicators: plan.feature_indicators(ctx.settings),
            },
            out,
        );
    }

    fn on_attempt_failed(
        &mut self,
        failure: AttemptFailure,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        let retryable = failure.is_retryable();
        match &self.state {
            TunnelState::Connected { .. } => {
                warn!("Tunnel lost: {}", failure.cause());
                self.attempt = None;
                if retryable {
                    self.attempt_index = 0;
                    self.connect(ctx, out);
                } else {
                    self.enter_error(failure.into_cause(), ctx, out);
                }
            }
            TunnelState::Connecting { .. } => {
                self.attempt = None;
                if retryable && self.attempt_index + 1 < self.policy.max_attempts {
                    self.attempt_index += 1;
                    info!(
                        "Attempt failed ({}), retrying ({}/{})",
                        failure.cause(),
                        self.attempt_index + 1,
                        self.policy.max_attempts
                    );
                    self.connect(ctx, out);
                } else {
                    if retryable {
                        warn!("Giving up after {} attempts", self.policy.max_attempts);
                    }
                    self.enter_error(failure.into_cause(), ctx, out);
                }
            }
            _ => {}
        }
    }

    /// Select a relay and start the attempt numbered `attempt_index`
    fn connect(&mut self, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        let plan = match self.select_plan(ctx) {
            Ok(plan) => plan,
            Err(error) => {
                warn!("No connection plan: {}", error);
                self.enter_error(ErrorStateCause::TunnelParameterError { error }, ctx, out);
                return;
            }
        };

        let allow_lan = ctx.settings.allow_lan;
        let policy = match plan.allowed_endpoint() {
            Some(peer_endpoint) => FirewallPolicy::Connecting {
                peer_endpoint,
                allow_lan,
            },
            // Custom host not resolved yet
            None => FirewallPolicy::Blocked { allow_lan },
        };
        if let Err(error) = self.firewall.apply_policy(policy) {
            self.enter_error(ErrorStateCause::SetFirewallPolicyError { error }, ctx, out);
            return;
        }

        let id = self.next_id;
        self.next_id = id.next();
        info!(
            "Starting attempt {} to {} ({}/{})",
            id,
            plan.exit_hostname().unwrap_or("custom endpoint"),
            self.attempt_index + 1,
            self.policy.max_attempts
        );

        let relay_info = plan.relay_info();
        let feature_indicators = plan.feature_indicators(ctx.settings);
        let handle = self.backend.start(id, plan.clone(), self.events.clone());
        self.attempt = Some(Attempt {
            handle,
            plan,
            deadline: Instant::now() + self.policy.attempt_timeout,
        });
        self.enter(
            TunnelState::Connecting {
                relay_info,
                feature_indicators,
            },
            out,
        );
    }

    fn select_plan(&mut self, ctx: &TunnelContext<'_>) -> Result<ConnectionPlan, ParameterGenerationError> {
        let selector = RelaySelector::new(
            ctx.relay_list,
            &ctx.settings.custom_lists,
            &ctx.settings.relay_overrides,
        );
        let wireguard = ctx.device.wireguard();
        let query = SelectorQuery::from_settings(ctx.settings, self.attempt_index, wireguard);

        match selector.select(&query, &mut self.rng) {
            Err(error) if self.attempt_index > 0 => {
                debug!("Fallback constraints match nothing ({}), using the base ones", error);
                let base = SelectorQuery::from_settings(ctx.settings, 0, wireguard);
                selector.select(&base, &mut self.rng)
            }
            result => result,
        }
    }

    /// Abort the current attempt and wait for it to go down
    fn begin_teardown(
        &mut self,
        after: ActionAfterDisconnect,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        if let Some(attempt) = self.attempt.take() {
            let id = attempt.handle.id();
            self.backend.abort(attempt.handle);
            self.teardown = Some(Teardown {
                id,
                deadline: Instant::now() + self.policy.attempt_timeout,
            });
        }
        self.enter_disconnecting(after, ctx, out);
        if self.teardown.is_none() {
            self.finish_disconnect(ctx, out);
        }
    }

    fn enter_disconnecting(
        &mut self,
        after_disconnect: ActionAfterDisconnect,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        let policy = FirewallPolicy::Blocked {
            allow_lan: ctx.settings.allow_lan,
        };
        if let Err(e) = self.firewall.apply_policy(policy) {
            warn!("Failed to block traffic while disconnecting: {}", e);
        }
        self.enter(TunnelState::Disconnecting { after_disconnect }, out);
    }

    fn finish_disconnect(&mut self, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        self.teardown = None;
        let TunnelState::Disconnecting { after_disconnect } = self.state else {
            return;
        };
        match after_disconnect {
            ActionAfterDisconnect::Nothing => {
                self.enter_disconnected(ctx.settings.block_when_disconnected, ctx, out);
            }
            ActionAfterDisconnect::Block => self.enter_disconnected(true, ctx, out),
            ActionAfterDisconnect::Reconnect => {
                self.attempt_index = 0;
                self.connect(ctx, out);
            }
        }
    }

    fn enter_disconnected(
        &mut self,
        locked_down: bool,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        self.apply_disconnected_policy(locked_down, ctx.settings.allow_lan);
        self.enter(
            TunnelState::Disconnected {
                last_known_location: self.last_location.clone(),
                locked_down,
            },
            out,
        );
    }

    fn apply_disconnected_policy(&mut self, locked_down: bool, allow_lan: bool) {
        let result = if locked_down {
            self.firewall.apply_policy(FirewallPolicy::Blocked { allow_lan })
        } else {
            self.firewall.reset_policy()
        };
        if let Err(e) = result {
            warn!("Failed to apply disconnected firewall policy: {}", e);
        }
    }

    fn enter_error(
        &mut self,
        cause: ErrorStateCause,
        ctx: &TunnelContext<'_>,
        out: &mut Vec<TunnelState>,
    ) {
        if let Some(attempt) = self.attempt.take() {
            self.backend.abort(attempt.handle);
        }

        let mut error_state = ErrorState::new(cause);
        let policy = FirewallPolicy::Blocked {
            allow_lan: ctx.settings.allow_lan,
        };
        if let Err(e) = self.firewall.apply_policy(policy) {
            error!("Failed to block traffic in the error state: {}", e);
            error_state.blocking_error = Some(e);
        }
        self.enter(TunnelState::Error { error_state }, out);
    }

    /// Apply the policy of the current state again, after `allow_lan` changed
    fn reapply_policy(&mut self, ctx: &TunnelContext<'_>, out: &mut Vec<TunnelState>) {
        let allow_lan = ctx.settings.allow_lan;
        let policy = match &self.state {
            TunnelState::Connecting { .. } => Some(
                match self.attempt.as_ref().and_then(|a| a.plan.allowed_endpoint()) {
                    Some(peer_endpoint) => FirewallPolicy::Connecting {
                        peer_endpoint,
                        allow_lan,
                    },
                    None => FirewallPolicy::Blocked { allow_lan },
                },
            ),
            TunnelState::Connected { relay_info, .. } => {
                let (address, protocol) = relay_info.tunnel_endpoint.first_hop();
                Some(FirewallPolicy::Connected {
                    peer_endpoint: AllowedEndpoint { address, protocol },
                    allow_lan,
                })
            }
            TunnelState::Disconnected { locked_down, .. } => {
                locked_down.then_some(FirewallPolicy::Blocked { allow_lan })
            }
            TunnelState::Disconnecting { .. } | TunnelState::Error { .. } => {
                Some(FirewallPolicy::Blocked { allow_lan })
            }
        };

        let result = match policy {
            Some(policy) => self.firewall.apply_policy(policy),
            None => self.firewall.reset_policy(),
        };
        if let Err(error) = result {
            if self.state.is_active() {
                self.enter_error(ErrorStateCause::SetFirewallPolicyError { error }, ctx, out);
            } else {
                warn!("Failed to re-apply firewall policy: {}", error);
            }
        }
    }

    fn enter(&mut self, state: TunnelState, out: &mut Vec<TunnelState>) {
        info!("Tunnel state: {} -> {}", self.state, state);
        self.state = state.clone();
        out.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEventReceiver;
    use crate::testing::{ScriptedBackend, logged_in_device, sample_relay_list};
    use fos_vpn::constraints::{
        ConnectionConfig, Constraint, CustomTunnelEndpoint, GeographicLocationConstraint,
        RelayConstraints, RelaySettings, TransportProtocol,
    };
    use fos_vpn::firewall::SoftFirewall;
    use fos_vpn::states::{AuthFailedError, FirewallPolicyError};
    use std::net::IpAddr;
    use tokio::sync::mpsc;

    struct Harness {
        machine: TunnelStateMachine<ScriptedBackend, SoftFirewall>,
        backend: ScriptedBackend,
        firewall: SoftFirewall,
        events: BackendEventReceiver,
        settings: Settings,
        relay_list: RelayList,
        device: DeviceState,
    }

    impl Harness {
        fn new(settings: Settings) -> Self {
            Self::with_policy(settings, RetryPolicy::default())
        }

        fn with_policy(settings: Settings, policy: RetryPolicy) -> Self {
            let backend = ScriptedBackend::new();
            let firewall = SoftFirewall::new();
            let (tx, events) = mpsc::unbounded_channel();
            let machine =
                TunnelStateMachine::new(backend.clone(), firewall.clone(), policy, tx, &settings)
                    .with_seed(7);
            Self {
                machine,
                backend,
                firewall,
                events,
                settings,
                relay_list: sample_relay_list(),
                device: logged_in_device(),
            }
        }

        fn send(&mut self, input: TunnelInput) -> Vec<TunnelState> {
            let ctx = TunnelContext {
                settings: &self.settings,
                relay_list: &self.relay_list,
                device: &self.device,
            };
            self.machine.handle(input, &ctx)
        }

        /// Feed everything the backend reported so far
        fn pump(&mut self) -> Vec<TunnelState> {
            let mut entered = Vec::new();
            while let Ok(message) = self.events.try_recv() {
                entered.extend(self.send(TunnelInput::Backend(message)));
            }
            entered
        }

        fn change_settings(&mut self, change: impl FnOnce(&mut Settings)) -> Vec<TunnelState> {
            let old = self.settings.clone();
            change(&mut self.settings);
            self.send(TunnelInput::SettingsChanged { old })
        }

        fn connected(settings: Settings) -> Self {
            let mut harness = Self::new(settings);
            harness.send(TunnelInput::Connect);
            harness.backend.up();
            harness.pump();
            assert!(harness.machine.state().is_connected());
            harness
        }
    }

    fn names(states: &[TunnelState]) -> Vec<&'static str> {
        states.iter().map(TunnelState::name).collect()
    }

    fn relay_ip() -> IpAddr {
        "185.213.154.66".parse().unwrap()
    }

    #[test]
    fn test_connect_then_up() {
        let mut harness = Harness::new(Settings::default());

        let entered = harness.send(TunnelInput::Connect);
        assert_eq!(names(&entered), ["connecting"]);
        let relay_info = entered[0].relay_info().unwrap();
        assert_eq!(relay_info.tunnel_endpoint.address.ip(), relay_ip());
        assert!(harness.firewall.allows(relay_ip()));
        assert!(!harness.firewall.allows("1.1.1.1".parse().unwrap()));

        harness.backend.up();
        let entered = harness.pump();
        assert_eq!(names(&entered), ["connected"]);
        assert!(matches!(
            harness.firewall.policy(),
            Some(FirewallPolicy::Connected { .. })
        ));
        assert_eq!(harness.machine.deadline(), None);
    }

    #[test]
    fn test_empty_relay_list_is_parameter_error() {
        let mut harness = Harness::new(Settings::default());
        harness.relay_list = RelayList::empty();

        let entered = harness.send(TunnelInput::Connect);
        assert_eq!(entered.len(), 1);
        let TunnelState::Error { error_state } = &entered[0] else {
            panic!("expected error state, got {:?}", entered[0]);
        };
        assert_eq!(
            error_state.cause,
            ErrorStateCause::TunnelParameterError {
                error: ParameterGenerationError::NoMatchingRelay
            }
        );
        assert!(error_state.is_blocking());
        assert!(harness.backend.started().is_empty());
        assert!(harness.firewall.is_blocking());
    }

    #[test]
    fn test_logged_out_has_no_key() {
        let mut harness = Harness::new(Settings::default());
        harness.device = DeviceState::LoggedOut;

        let entered = harness.send(TunnelInput::Connect);
        assert!(matches!(
            &entered[..],
            [TunnelState::Error { error_state }]
                if error_state.cause == ErrorStateCause::TunnelParameterError {
                    error: ParameterGenerationError::NoWireguardKey
                }
        ));
    }

    #[test]
    fn test_disconnect_while_connecting_aborts_attempt() {
        let mut harness = Harness::new(Settings::default());
        harness.send(TunnelInput::Connect);
        let attempt = harness.backend.last_attempt().unwrap();

        let entered = harness.send(TunnelInput::Disconnect);
        assert_eq!(
            entered,
            [TunnelState::Disconnecting {
                after_disconnect: ActionAfterDisconnect::Nothing
            }]
        );
        assert_eq!(harness.backend.aborted(), [attempt]);

        // The aborted attempt reports up after the abort
        harness.backend.up();
        let entered = harness.pump();
        assert_eq!(names(&entered), ["disconnected"]);
        assert!(harness.machine.state().is_disconnected());
        assert_eq!(harness.firewall.policy(), None);
    }

    #[test]
    fn test_transient_failures_are_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let mut harness = Harness::with_policy(Settings::default(), policy);
        let mut entered = harness.send(TunnelInput::Connect);

        for _ in 0..3 {
            harness
                .backend
                .fail(AttemptFailure::Transient(ErrorStateCause::StartTunnelError));
            entered.extend(harness.pump());
        }

        assert_eq!(names(&entered), ["connecting", "connecting", "connecting", "error"]);
        assert_eq!(harness.backend.started().len(), 3);
        let TunnelState::Error { error_state } = harness.machine.state() else {
            panic!("expected error state");
        };
        assert_eq!(error_state.cause, ErrorStateCause::StartTunnelError);
    }

    #[test]
    fn test_policy_failure_is_not_retried() {
        let mut harness = Harness::new(Settings::default());
        harness.send(TunnelInput::Connect);

        let cause = ErrorStateCause::AuthFailed {
            reason: AuthFailedError::ExpiredAccount,
        };
        harness.backend.fail(AttemptFailure::Transient(cause.clone()));
        let entered = harness.pump();

        assert_eq!(names(&entered), ["error"]);
        assert_eq!(harness.backend.started().len(), 1);
        assert!(matches!(
            harness.machine.state(),
            TunnelState::Error { error_state } if error_state.cause == cause
        ));
    }

    #[test]
    fn test_timeout_starts_next_attempt() {
        let mut harness = Harness::new(Settings::default());
        harness.send(TunnelInput::Connect);
        let (first, _) = harness.machine.deadline().unwrap();

        let entered = harness.send(TunnelInput::AttemptTimeout(first));
        assert_eq!(names(&entered), ["connecting"]);
        assert_eq!(harness.backend.aborted(), [first]);

        // Down from the timed out attempt is stale
        assert!(harness.pump().is_empty());
        let (second, _) = harness.machine.deadline().unwrap();
        assert!(second > first);

        // A timeout for an old attempt does nothing
        assert!(harness.send(TunnelInput::AttemptTimeout(first)).is_empty());
    }

    #[test]
    fn test_block_when_disconnected_locks_down() {
        let settings = Settings {
            block_when_disconnected: true,
            ..Settings::default()
        };
        let mut harness = Harness::connected(settings);

        let entered = harness.send(TunnelInput::Disconnect);
        assert_eq!(
            entered,
            [TunnelState::Disconnecting {
                after_disconnect: ActionAfterDisconnect::Block
            }]
        );
        let entered = harness.pump();
        assert!(matches!(
            &entered[..],
            [TunnelState::Disconnected { locked_down: true, last_known_location: Some(_) }]
        ));
        assert!(harness.firewall.is_blocking());
    }

    #[test]
    fn test_relay_change_reconnects() {
        let mut harness = Harness::connected(Settings::default());

        let entered = harness.change_settings(|settings| {
            settings.relay_settings = RelaySettings::Normal(RelayConstraints {
                location: Constraint::Only(GeographicLocationConstraint::country("se").into()),
                ..RelayConstraints::default()
            });
        });
        assert_eq!(
            entered,
            [TunnelState::Disconnecting {
                after_disconnect: ActionAfterDisconnect::Reconnect
            }]
        );
        assert_eq!(names(&harness.pump()), ["connecting"]);
        assert_eq!(harness.backend.started().len(), 2);
    }

    #[test]
    fn test_allow_lan_reapplies_policy_silently() {
        let mut harness = Harness::connected(Settings::default());

        let entered = harness.change_settings(|settings| settings.allow_lan = true);
        assert!(entered.is_empty());
        assert!(harness.firewall.policy().unwrap().allow_lan());
        assert!(harness.machine.state().is_connected());
    }

    #[test]
    fn test_lockdown_toggle_while_disconnected() {
        let mut harness = Harness::new(Settings::default());

        let entered = harness.change_settings(|settings| settings.block_when_disconnected = true);
        assert_eq!(entered, [TunnelState::disconnected(true)]);
        assert!(harness.firewall.is_blocking());

        let entered = harness.change_settings(|settings| settings.auto_connect = true);
        assert!(entered.is_empty());
    }

    #[test]
    fn test_unsolicited_down_reconnects() {
        let mut harness = Harness::connected(Settings::default());

        harness.backend.down();
        assert_eq!(names(&harness.pump()), ["connecting"]);
        assert_eq!(harness.backend.started().len(), 2);
    }

    #[test]
    fn test_locked_firewall_is_policy_error() {
        let mut harness = Harness::new(Settings::default());
        harness.firewall.lock_by(4242, "other-vpn");

        let entered = harness.send(TunnelInput::Connect);
        let [TunnelState::Error { error_state }] = &entered[..] else {
            panic!("expected one error state, got {entered:?}");
        };
        assert!(error_state.cause.is_policy());
        assert_eq!(
            error_state.blocking_error,
            Some(FirewallPolicyError::Locked {
                lock_pid: Some(4242),
                lock_name: Some("other-vpn".into()),
            })
        );
        assert!(harness.backend.started().is_empty());
    }

    #[test]
    fn test_resolved_custom_host_is_let_through() {
        let mut settings = Settings::default();
        settings.relay_settings = RelaySettings::Custom(CustomTunnelEndpoint {
            host: "vpn.example.net".into(),
            config: ConnectionConfig::OpenVpn {
                port: 1194,
                protocol: TransportProtocol::Udp,
                username: "user".into(),
                password: "pass".into(),
            },
        });
        let mut harness = Harness::new(settings);
        let peer: IpAddr = "203.0.113.5".parse().unwrap();

        let entered = harness.send(TunnelInput::Connect);
        assert_eq!(names(&entered), ["connecting"]);
        assert!(!harness.firewall.allows(peer));

        let attempt = harness.backend.last_attempt().unwrap();
        harness
            .backend
            .send(attempt, BackendEvent::Resolved(SocketAddr::new(peer, 1194)));
        assert!(harness.pump().is_empty());
        assert!(matches!(
            harness.firewall.policy(),
            Some(FirewallPolicy::Connecting { .. })
        ));
        assert!(harness.firewall.allows(peer));

        harness.backend.up();
        let entered = harness.pump();
        assert_eq!(names(&entered), ["connected"]);
        let relay_info = entered[0].relay_info().unwrap();
        assert_eq!(relay_info.tunnel_endpoint.address, SocketAddr::new(peer, 1194));
    }

    #[test]
    fn test_connect_while_disconnecting_reconnects() {
        let mut harness = Harness::connected(Settings::default());
        harness.backend.silent_aborts();
        let attempt = harness.backend.last_attempt().unwrap();

        harness.send(TunnelInput::Disconnect);
        let entered = harness.send(TunnelInput::Connect);
        assert_eq!(
            entered,
            [TunnelState::Disconnecting {
                after_disconnect: ActionAfterDisconnect::Reconnect
            }]
        );

        harness.backend.send(attempt, BackendEvent::Down);
        assert_eq!(names(&harness.pump()), ["connecting"]);
    }

    #[test]
    fn test_disconnect_from_error() {
        let mut harness = Harness::new(Settings::default());
        harness.relay_list = RelayList::empty();
        harness.send(TunnelInput::Connect);

        let entered = harness.send(TunnelInput::Disconnect);
        assert_eq!(names(&entered), ["disconnecting", "disconnected"]);
    }

    #[test]
    fn test_retry_from_error() {
        let mut harness = Harness::new(Settings::default());
        harness.relay_list = RelayList::empty();
        harness.send(TunnelInput::Connect);

        harness.relay_list = sample_relay_list();
        assert_eq!(names(&harness.send(TunnelInput::Reconnect)), ["connecting"]);
    }

    #[test]
    fn test_key_rotation_reconnects() {
        let mut harness = Harness::connected(Settings::default());

        assert!(
            harness
                .send(TunnelInput::DeviceChanged(DeviceEventCause::Updated))
                .is_empty()
        );

        harness.device = logged_in_device();
        let entered = harness.send(TunnelInput::DeviceChanged(DeviceEventCause::RotatedKey));
        assert_eq!(names(&entered), ["disconnecting"]);
        assert_eq!(names(&harness.pump()), ["connecting"]);
    }

    #[test]
    fn test_every_transition_is_one_state() {
        let mut harness = Harness::new(Settings::default());
        let inputs = [
            TunnelInput::Connect,
            TunnelInput::Connect,
            TunnelInput::Disconnect,
            TunnelInput::Disconnect,
            TunnelInput::Connect,
            TunnelInput::Reconnect,
            TunnelInput::Disconnect,
            TunnelInput::Connect,
        ];

        for input in inputs {
            let mut entered = harness.send(input);
            entered.extend(harness.pump());
            for pair in entered.windows(2) {
                assert_ne!(pair[0], pair[1]);
            }
            if let Some(last) = entered.last() {
                assert_eq!(last, harness.machine.state());
            }
        }
        assert!(harness.machine.state().is_connecting());
        assert!(harness.backend.started().iter().all(|id| {
            harness.backend.aborted().contains(id) || Some(*id) == harness.machine.current_attempt()
        }));
    }
}
