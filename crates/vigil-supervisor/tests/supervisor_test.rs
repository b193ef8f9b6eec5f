//! Integration tests for application supervision.
//!
//! These drive the registry/app/process stack through fake collaborators:
//! a recording launcher hands out fake pids, and child deaths are simulated
//! by feeding statuses with explicit timestamps, so the fault-rate limiter
//! and the kill-timer behavior are exercised without real children or
//! real sleeps.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{Gid, Pid, Uid};
use vigil_common::config::MemoryConfig;
use vigil_common::error::{Result, VigilError};
use vigil_common::types::{AppFaultAction, AppState, ChildStatus, SchedPolicy, WatchdogAction};
use vigil_core::rlimits::{AppLimiter, AppLimits};
use vigil_core::sandbox::Sandbox;
use vigil_core::users::UserRegistry;
use vigil_supervisor::SupervisorCtx;
use vigil_supervisor::fault_record::FaultRecord;
use vigil_supervisor::launcher::{LaunchSpec, Launcher};
use vigil_supervisor::registry::AppRegistry;

// ── Fakes ────────────────────────────────────────────────────────────

/// Hands out sequential fake pids and records everything it is asked to do.
#[derive(Default)]
struct FakeLauncher {
    next_pid: i32,
    attempts: usize,
    fail_on_attempt: Option<usize>,
    launches: Vec<LaunchSpec>,
    signals: Vec<(Pid, Signal)>,
    uid_sweeps: Vec<Uid>,
}

impl Launcher for FakeLauncher {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Pid> {
        let attempt = self.attempts;
        self.attempts += 1;
        if self.fail_on_attempt == Some(attempt) {
            return Err(VigilError::fault("injected launch failure"));
        }
        self.next_pid += 1;
        self.launches.push(spec.clone());
        Ok(Pid::from_raw(self.next_pid))
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        self.signals.push((pid, signal));
        Ok(())
    }

    fn kill_all_for_uid(&mut self, uid: Uid) -> Result<()> {
        self.uid_sweeps.push(uid);
        Ok(())
    }
}

#[derive(Default)]
struct FakeSandbox {
    setups: usize,
    populates: usize,
    removes: usize,
}

impl Sandbox for FakeSandbox {
    fn setup(&mut self, _app_name: &str, _root: &Path) -> Result<()> {
        self.setups += 1;
        Ok(())
    }

    fn populate(
        &mut self,
        _app_name: &str,
        _root: &Path,
        _home_dir: &Path,
        _uid: Uid,
        _gid: Gid,
    ) -> Result<()> {
        self.populates += 1;
        Ok(())
    }

    fn remove(&mut self, _app_name: &str, _root: &Path) -> Result<()> {
        self.removes += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeLimiter {
    sets: usize,
    clears: usize,
}

impl AppLimiter for FakeLimiter {
    fn set_app_limits(&mut self, _sandbox_root: &Path, _limits: &AppLimits) -> Result<()> {
        self.sets += 1;
        Ok(())
    }

    fn clear_app_limits(&mut self, _sandbox_root: &Path) -> Result<()> {
        self.clears += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeUsers {
    groups_created: Vec<String>,
}

impl UserRegistry for FakeUsers {
    fn user_name_for_app(&self, app_name: &str) -> String {
        format!("app{app_name}")
    }

    fn resolve_ids(&mut self, _user_name: &str) -> Result<(Uid, Gid)> {
        Ok((Uid::from_raw(1000), Gid::from_raw(1000)))
    }

    fn create_group(&mut self, group_name: &str) -> Result<Gid> {
        self.groups_created.push(group_name.to_owned());
        let gid = 2000 + u32::try_from(self.groups_created.len()).unwrap();
        Ok(Gid::from_raw(gid))
    }
}

/// One bundle of fake collaborators plus the config and a tempdir-backed
/// fault record.
struct Fixture {
    cfg: MemoryConfig,
    launcher: FakeLauncher,
    sandbox: FakeSandbox,
    limiter: FakeLimiter,
    users: FakeUsers,
    record: FaultRecord,
    _record_dir: tempfile::TempDir,
}

impl Fixture {
    fn new(document: &str) -> Self {
        let record_dir = tempfile::tempdir().expect("tempdir");
        Self {
            cfg: MemoryConfig::from_yaml_str(document).expect("test config parses"),
            launcher: FakeLauncher::default(),
            sandbox: FakeSandbox::default(),
            limiter: FakeLimiter::default(),
            users: FakeUsers::default(),
            record: FaultRecord::new(record_dir.path().join("reboot-fault")),
            _record_dir: record_dir,
        }
    }

    fn with_record_path(document: &str, record_path: PathBuf) -> Self {
        let record_dir = tempfile::tempdir().expect("tempdir");
        Self {
            record: FaultRecord::new(record_path),
            ..Self::new_with_dir(document, record_dir)
        }
    }

    fn new_with_dir(document: &str, record_dir: tempfile::TempDir) -> Self {
        Self {
            cfg: MemoryConfig::from_yaml_str(document).expect("test config parses"),
            launcher: FakeLauncher::default(),
            sandbox: FakeSandbox::default(),
            limiter: FakeLimiter::default(),
            users: FakeUsers::default(),
            record: FaultRecord::new(record_dir.path().join("reboot-fault")),
            _record_dir: record_dir,
        }
    }

    fn ctx(&mut self) -> SupervisorCtx<'_> {
        SupervisorCtx {
            cfg: &self.cfg,
            launcher: &mut self.launcher,
            sandbox: &mut self.sandbox,
            limiter: &mut self.limiter,
            users: &mut self.users,
            fault_record: &self.record,
        }
    }
}

const WEB_APP: &str = r#"
apps:
  web:
    sandboxed: true
    groups: [www-data]
    procs:
      p1:
        args: [/bin/p1]
        envVars:
          PATH: /usr/bin
        priority: high
        faultAction: restart
      p2:
        args: [/bin/p2]
        envVars:
          PATH: /usr/bin
        priority: rt5
"#;

/// Creates and starts the `web` app, returning the registry and the pids of
/// its two processes.
fn started_web_app(fixture: &mut Fixture) -> (AppRegistry, Pid, Pid) {
    let mut registry = AppRegistry::new();
    let now = Instant::now();
    {
        let mut ctx = fixture.ctx();
        let _ = registry.create_app("/apps/web", &mut ctx).expect("create app");
        registry.start_app("web", &mut ctx, now).expect("start app");
    }
    let app = registry.app("web").expect("app exists");
    let pids: Vec<Pid> = app
        .procs()
        .iter()
        .map(|entry| entry.process().pid().expect("live pid"))
        .collect();
    (registry, pids[0], pids[1])
}

// ── Creation and start ───────────────────────────────────────────────

#[test]
fn create_builds_processes_in_config_order() {
    let mut fixture = Fixture::new(WEB_APP);
    let mut registry = AppRegistry::new();
    let mut ctx = fixture.ctx();

    let app = registry.create_app("/apps/web", &mut ctx).expect("create app");
    assert_eq!(app.name(), "web");
    assert!(app.sandboxed());
    assert_eq!(app.state(), AppState::Stopped);
    assert_eq!(app.uid(), Uid::from_raw(1000));
    let names: Vec<&str> = app.procs().iter().map(|e| e.process().name()).collect();
    assert_eq!(names, vec!["p1", "p2"]);
    drop(ctx);
    assert_eq!(fixture.users.groups_created, vec!["www-data"]);
}

#[test]
fn start_prepares_sandbox_and_launches_in_order() {
    let mut fixture = Fixture::new(WEB_APP);
    let (registry, _p1, _p2) = started_web_app(&mut fixture);

    assert_eq!(registry.app("web").expect("app").state(), AppState::Running);
    assert_eq!(fixture.sandbox.setups, 1);
    assert_eq!(fixture.sandbox.populates, 1);
    assert_eq!(fixture.limiter.sets, 1);

    let launches = &fixture.launcher.launches;
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].proc_name, "p1");
    assert_eq!(launches[0].policy, SchedPolicy::Normal { nice: -10 });
    assert_eq!(launches[1].proc_name, "p2");
    assert_eq!(launches[1].policy, SchedPolicy::RoundRobin { level: 5 });

    let confinement = launches[0].confinement.as_ref().expect("sandboxed launch");
    assert!(confinement.root.ends_with("web"));
    assert_eq!(confinement.uid, Uid::from_raw(1000));
    assert_eq!(confinement.groups.len(), 1);
}

#[test]
fn starting_a_running_app_fails() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, _p1, _p2) = started_web_app(&mut fixture);
    let mut ctx = fixture.ctx();
    assert!(matches!(
        registry.start_app("web", &mut ctx, Instant::now()),
        Err(VigilError::AlreadyRunning { .. })
    ));
}

#[test]
fn launch_failure_during_start_stops_the_whole_app() {
    let mut fixture = Fixture::new(WEB_APP);
    fixture.launcher.fail_on_attempt = Some(1);

    let mut registry = AppRegistry::new();
    let mut ctx = fixture.ctx();
    let _ = registry.create_app("/apps/web", &mut ctx).expect("create app");
    assert!(registry.start_app("web", &mut ctx, Instant::now()).is_err());
    drop(ctx);

    // The already-started first process got a graceful stop, and the uid
    // sweep ran.
    let p1_pid = Pid::from_raw(1);
    assert!(fixture.launcher.signals.contains(&(p1_pid, Signal::SIGTERM)));
    assert_eq!(fixture.launcher.uid_sweeps, vec![Uid::from_raw(1000)]);
}

// ── Stop ─────────────────────────────────────────────────────────────

#[test]
fn stopping_a_stopped_app_is_a_logged_noop() {
    let mut fixture = Fixture::new(WEB_APP);
    let mut registry = AppRegistry::new();
    let mut ctx = fixture.ctx();
    let _ = registry.create_app("/apps/web", &mut ctx).expect("create app");
    registry.stop_app("web", &mut ctx, Instant::now()).expect("stop is routable");
    drop(ctx);

    assert!(fixture.launcher.signals.is_empty());
    assert!(fixture.launcher.uid_sweeps.is_empty());
    assert_eq!(
        registry.app("web").expect("app").state(),
        AppState::Stopped
    );
}

#[test]
fn stop_terminates_processes_and_sweeps_the_uid() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, p1, p2) = started_web_app(&mut fixture);
    let now = Instant::now();

    {
        let mut ctx = fixture.ctx();
        registry.stop_app("web", &mut ctx, now).expect("stop");
    }
    assert!(fixture.launcher.signals.contains(&(p1, Signal::SIGTERM)));
    assert!(fixture.launcher.signals.contains(&(p2, Signal::SIGTERM)));
    assert_eq!(fixture.launcher.uid_sweeps, vec![Uid::from_raw(1000)]);

    // Both kill timers are armed; the app is not stopped until the deaths
    // are observed.
    assert_eq!(registry.app("web").expect("app").state(), AppState::Running);
    assert!(registry.next_kill_deadline().is_some());

    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_child_status(p1, ChildStatus::Signaled(15), &mut ctx, now)
            .expect("p1 death routed");
        assert_eq!(action, AppFaultAction::Ignore);
        let action = registry
            .handle_child_status(p2, ChildStatus::Signaled(15), &mut ctx, now)
            .expect("p2 death routed");
        assert_eq!(action, AppFaultAction::Ignore);
    }

    assert_eq!(registry.app("web").expect("app").state(), AppState::Stopped);
    assert!(registry.next_kill_deadline().is_none());
    assert_eq!(fixture.sandbox.removes, 1);
    assert_eq!(fixture.limiter.clears, 1);
}

// ── Fault handling ───────────────────────────────────────────────────

#[test]
fn restart_fault_relaunches_the_process() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, p1, _p2) = started_web_app(&mut fixture);
    let now = Instant::now();

    let mut ctx = fixture.ctx();
    let action = registry
        .handle_child_status(p1, ChildStatus::Exited(1), &mut ctx, now)
        .expect("fault routed");
    assert_eq!(action, AppFaultAction::Ignore);
    drop(ctx);

    assert_eq!(fixture.launcher.launches.len(), 3);
    assert_eq!(fixture.launcher.launches[2].proc_name, "p1");
    assert_eq!(registry.app("web").expect("app").state(), AppState::Running);
}

#[test]
fn two_restart_faults_within_a_second_escalate_to_stop_app() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, p1, p2) = started_web_app(&mut fixture);
    let t0 = Instant::now();

    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_child_status(p1, ChildStatus::Exited(1), &mut ctx, t0)
            .expect("first fault");
        assert_eq!(action, AppFaultAction::Ignore);
    }

    // The restarted process got a new pid.
    let p1_restarted = registry
        .app("web")
        .expect("app")
        .procs()[0]
        .process()
        .pid()
        .expect("restarted pid");
    assert_ne!(p1_restarted, p1);

    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_child_status(
                p1_restarted,
                ChildStatus::Exited(1),
                &mut ctx,
                t0 + Duration::from_millis(500),
            )
            .expect("second fault");
        assert_eq!(action, AppFaultAction::StopApp);
    }

    // The limit was reached: no third launch, the app is stopping.
    assert_eq!(fixture.launcher.launches.len(), 3);
    assert!(fixture.launcher.signals.contains(&(p2, Signal::SIGTERM)));

    // Once the surviving process reports not-running the app is stopped and
    // the sandbox is gone.
    {
        let mut ctx = fixture.ctx();
        let _ = registry
            .handle_child_status(p2, ChildStatus::Signaled(15), &mut ctx, t0 + Duration::from_secs(1))
            .expect("p2 death routed");
    }
    assert_eq!(registry.app("web").expect("app").state(), AppState::Stopped);
    assert_eq!(fixture.sandbox.removes, 1);
    assert_eq!(fixture.limiter.clears, 1);
}

#[test]
fn restart_faults_spaced_out_keep_restarting() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, p1, _p2) = started_web_app(&mut fixture);
    let t0 = Instant::now();

    {
        let mut ctx = fixture.ctx();
        let _ = registry
            .handle_child_status(p1, ChildStatus::Exited(1), &mut ctx, t0)
            .expect("first fault");
    }
    let p1_restarted = registry.app("web").expect("app").procs()[0]
        .process()
        .pid()
        .expect("restarted pid");

    let mut ctx = fixture.ctx();
    let action = registry
        .handle_child_status(
            p1_restarted,
            ChildStatus::Exited(1),
            &mut ctx,
            t0 + Duration::from_secs(2),
        )
        .expect("second fault");
    assert_eq!(action, AppFaultAction::Ignore);
    drop(ctx);
    assert_eq!(fixture.launcher.launches.len(), 4);
}

#[test]
fn restart_app_fault_restarts_the_whole_app() {
    let document = r#"
apps:
  web:
    sandboxed: true
    procs:
      p1:
        args: [/bin/p1]
        faultAction: restartApp
      p2:
        args: [/bin/p2]
"#;
    let mut fixture = Fixture::new(document);
    let (mut registry, p1, p2) = started_web_app(&mut fixture);
    let now = Instant::now();

    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_child_status(p1, ChildStatus::Exited(1), &mut ctx, now)
            .expect("fault routed");
        assert_eq!(action, AppFaultAction::RestartApp);
    }
    // The surviving process was asked to stop; once it dies the app stops
    // and is started again.
    assert!(fixture.launcher.signals.contains(&(p2, Signal::SIGTERM)));
    {
        let mut ctx = fixture.ctx();
        let _ = registry
            .handle_child_status(p2, ChildStatus::Signaled(15), &mut ctx, now)
            .expect("p2 death routed");
    }
    assert_eq!(registry.app("web").expect("app").state(), AppState::Running);
    assert_eq!(fixture.launcher.launches.len(), 4);
}

#[test]
fn reboot_fault_persists_the_record_and_then_limits() {
    let document = r#"
apps:
  web:
    sandboxed: true
    procs:
      p1:
        args: [/bin/p1]
        faultAction: reboot
      p2:
        args: [/bin/p2]
"#;
    let shared_dir = tempfile::tempdir().expect("tempdir");
    let record_path = shared_dir.path().join("reboot-fault");

    // First boot: the fault escalates to a reboot and persists the record.
    let mut fixture = Fixture::with_record_path(document, record_path.clone());
    let (mut registry, p1, _p2) = started_web_app(&mut fixture);
    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_child_status(p1, ChildStatus::Exited(1), &mut ctx, Instant::now())
            .expect("fault routed");
        assert_eq!(action, AppFaultAction::Reboot);
    }
    assert_eq!(
        std::fs::read_to_string(&record_path).expect("record written"),
        "web/p1"
    );

    // Next boot: the record still names web/p1, so the same fault is
    // stopped instead of rebooting again.
    let mut fixture = Fixture::with_record_path(document, record_path.clone());
    let (mut registry, p1, _p2) = started_web_app(&mut fixture);
    let mut ctx = fixture.ctx();
    let action = registry
        .handle_child_status(p1, ChildStatus::Exited(1), &mut ctx, Instant::now())
        .expect("fault routed");
    assert_eq!(action, AppFaultAction::StopApp);
}

#[test]
fn unknown_pid_is_not_found() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, _p1, _p2) = started_web_app(&mut fixture);
    let mut ctx = fixture.ctx();
    assert!(matches!(
        registry.handle_child_status(Pid::from_raw(9999), ChildStatus::Exited(1), &mut ctx, Instant::now()),
        Err(VigilError::NotFound { .. })
    ));
}

#[test]
fn duplicate_death_notification_is_not_misclassified() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, p1, p2) = started_web_app(&mut fixture);
    let now = Instant::now();

    {
        let mut ctx = fixture.ctx();
        registry.stop_app("web", &mut ctx, now).expect("stop");
        let action = registry
            .handle_child_status(p1, ChildStatus::Signaled(15), &mut ctx, now)
            .expect("first notification");
        assert_eq!(action, AppFaultAction::Ignore);

        // The pid is no longer owned by any process, so a duplicate
        // delivery cannot match, let alone be classified as a fault.
        assert!(matches!(
            registry.handle_child_status(p1, ChildStatus::Signaled(15), &mut ctx, now),
            Err(VigilError::NotFound { .. })
        ));

        let _ = registry
            .handle_child_status(p2, ChildStatus::Signaled(15), &mut ctx, now)
            .expect("p2 death routed");
    }
    assert_eq!(registry.app("web").expect("app").state(), AppState::Stopped);
}

// ── Watchdog ─────────────────────────────────────────────────────────

#[test]
fn watchdog_restart_policy_restarts_the_process_after_its_death() {
    let document = r#"
apps:
  web:
    sandboxed: true
    procs:
      p1:
        args: [/bin/p1]
        watchdogAction: restart
      p2:
        args: [/bin/p2]
"#;
    let mut fixture = Fixture::new(document);
    let (mut registry, p1, _p2) = started_web_app(&mut fixture);
    let now = Instant::now();

    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_watchdog_timeout(p1, &mut ctx, now)
            .expect("timeout routed");
        assert_eq!(action, WatchdogAction::Handled);
    }
    assert!(fixture.launcher.signals.contains(&(p1, Signal::SIGTERM)));

    // The commanded death consumes the restart marker and relaunches p1.
    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_child_status(p1, ChildStatus::Signaled(15), &mut ctx, now)
            .expect("death routed");
        assert_eq!(action, AppFaultAction::Ignore);
    }
    assert_eq!(fixture.launcher.launches.len(), 3);
    assert_eq!(fixture.launcher.launches[2].proc_name, "p1");
    assert_eq!(registry.app("web").expect("app").state(), AppState::Running);
}

#[test]
fn watchdog_falls_back_to_the_app_level_policy() {
    let document = r#"
apps:
  web:
    sandboxed: true
    watchdogAction: stopApp
    procs:
      p1:
        args: [/bin/p1]
      p2:
        args: [/bin/p2]
"#;
    let mut fixture = Fixture::new(document);
    let (mut registry, p1, p2) = started_web_app(&mut fixture);
    let now = Instant::now();

    {
        let mut ctx = fixture.ctx();
        let action = registry
            .handle_watchdog_timeout(p1, &mut ctx, now)
            .expect("timeout routed");
        assert_eq!(action, WatchdogAction::StopApp);
    }
    // The whole app is being stopped: both processes were signalled.
    assert!(fixture.launcher.signals.contains(&(p1, Signal::SIGTERM)));
    assert!(fixture.launcher.signals.contains(&(p2, Signal::SIGTERM)));

    let mut ctx = fixture.ctx();
    let _ = registry
        .handle_child_status(p1, ChildStatus::Signaled(15), &mut ctx, now)
        .expect("p1 death");
    let _ = registry
        .handle_child_status(p2, ChildStatus::Signaled(15), &mut ctx, now)
        .expect("p2 death");
    drop(ctx);
    assert_eq!(registry.app("web").expect("app").state(), AppState::Stopped);
}

// ── Registry bookkeeping ─────────────────────────────────────────────

#[test]
fn deleting_a_running_app_is_rejected() {
    let mut fixture = Fixture::new(WEB_APP);
    let (mut registry, p1, p2) = started_web_app(&mut fixture);

    assert!(matches!(
        registry.delete_app("web"),
        Err(VigilError::Busy { .. })
    ));

    let now = Instant::now();
    let mut ctx = fixture.ctx();
    registry.stop_app("web", &mut ctx, now).expect("stop");
    let _ = registry
        .handle_child_status(p1, ChildStatus::Signaled(15), &mut ctx, now)
        .expect("p1 death");
    let _ = registry
        .handle_child_status(p2, ChildStatus::Signaled(15), &mut ctx, now)
        .expect("p2 death");
    drop(ctx);

    registry.delete_app("web").expect("stopped app can be deleted");
    assert!(registry.app("web").is_none());
}

#[test]
fn duplicate_app_names_are_rejected() {
    let mut fixture = Fixture::new(WEB_APP);
    let mut registry = AppRegistry::new();
    let mut ctx = fixture.ctx();
    let _ = registry.create_app("/apps/web", &mut ctx).expect("first create");
    assert!(matches!(
        registry.create_app("/apps/web", &mut ctx),
        Err(VigilError::BadParameter { .. })
    ));
}
