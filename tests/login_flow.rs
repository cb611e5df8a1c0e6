use anyhow::{Context, Result};
use bastion::{
    auth::{
        AuditEvent, AuthConfig, Authenticator, JwtIssuer, LoginOutcome, LoginRequest,
        MemoryIdentityStore, RecordingAuditSink, Rejection, TokenConfig,
    },
    clock::{Clock, ManualClock},
    rbac::{
        MemoryRbacRepository, NewPermission, NewRole, PermissionUpdate, RbacAdmin, RbacError,
        RbacResolver, Subject,
    },
    security::{ChallengeManager, ClientContext, DeviceTracker},
    store::MemoryStore,
};
use secrecy::SecretString;
use std::{collections::BTreeSet, sync::Arc, time::Duration};

const PASSWORD: &str = "Correct#Horse1";
const WRONG: &str = "Wrong#Horse1";

struct Fixture {
    clock: Arc<ManualClock>,
    identity: Arc<MemoryIdentityStore>,
    audit: Arc<RecordingAuditSink>,
    auth: Authenticator,
}

async fn fixture() -> Result<Fixture> {
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let identity = Arc::new(MemoryIdentityStore::new());
    for name in ["bob", "carol", "dave"] {
        identity.insert(name, PASSWORD, true, false).await?;
    }
    let tokens = Arc::new(JwtIssuer::new(
        TokenConfig::new(SecretString::from("flow-secret".to_string())),
        store.clone(),
        clock.clone(),
    ));
    let audit = Arc::new(RecordingAuditSink::new());
    let auth = Authenticator::new(
        store,
        clock.clone(),
        identity.clone(),
        tokens,
        audit.clone(),
        AuthConfig::default(),
    );
    Ok(Fixture {
        clock,
        identity,
        audit,
        auth,
    })
}

fn from(ip: &str) -> ClientContext {
    ClientContext::new(ip)
        .with_user_agent("Mozilla/5.0 (X11; Linux x86_64)")
        .with_accept_language("en-US,en;q=0.9")
        .with_accept_encoding("gzip, br")
}

fn rejected(outcome: &LoginOutcome) -> Result<Rejection> {
    outcome.rejection().cloned().context("login unexpectedly succeeded")
}

#[tokio::test]
async fn four_failures_require_a_challenge() -> Result<()> {
    let f = fixture().await?;
    let ctx = from("1.2.3.4");

    for _ in 0..3 {
        f.auth.login(&LoginRequest::new("bob", WRONG), &ctx).await?;
    }
    // Third failure leaves two attempts, so the challenge already applies.
    let outcome = f.auth.login(&LoginRequest::new("bob", PASSWORD), &ctx).await?;
    assert_eq!(
        rejected(&outcome)?,
        Rejection::ChallengeRequired {
            remaining_attempts: 2
        }
    );

    let challenge = f.auth.challenge(&ctx).await?;
    let outcome = f
        .auth
        .login(&LoginRequest::new("bob", WRONG).with_captcha(&challenge.text), &ctx)
        .await?;
    assert_eq!(
        rejected(&outcome)?,
        Rejection::InvalidCredentials {
            remaining_attempts: 1,
            challenge_next: true
        }
    );
    assert_eq!(f.auth.limiter().remaining_attempts("1.2.3.4:bob").await, 1);

    let outcome = f.auth.login(&LoginRequest::new("bob", PASSWORD), &ctx).await?;
    assert_eq!(rejected(&outcome)?.code(), "challenge_required");
    Ok(())
}

#[tokio::test]
async fn fifth_failure_with_wrong_challenge_locks() -> Result<()> {
    let f = fixture().await?;
    let ctx = from("1.2.3.4");
    for _ in 0..4 {
        let challenge = f.auth.challenge(&ctx).await?;
        f.auth
            .login(&LoginRequest::new("bob", WRONG).with_captcha(&challenge.text), &ctx)
            .await?;
    }

    f.auth.challenge(&ctx).await?;
    let outcome = f
        .auth
        .login(&LoginRequest::new("bob", PASSWORD).with_captcha("nope"), &ctx)
        .await?;
    assert_eq!(rejected(&outcome)?.code(), "invalid_credentials_or_challenge");
    assert!(f.auth.limiter().check_lockout("1.2.3.4:bob").await);

    f.clock.advance(Duration::from_secs(10));
    let outcome = f.auth.login(&LoginRequest::new("bob", PASSWORD), &ctx).await?;
    assert_eq!(
        rejected(&outcome)?,
        Rejection::Locked {
            remaining_seconds: 890
        }
    );

    // The lock is scoped to ip:username.
    let outcome = f
        .auth
        .login(&LoginRequest::new("bob", PASSWORD), &from("5.6.7.8"))
        .await?;
    assert!(outcome.is_success());
    Ok(())
}

#[tokio::test]
async fn ten_failures_across_usernames_ban_the_address() -> Result<()> {
    let f = fixture().await?;
    let ctx = from("9.9.9.9");

    // Three failures per username stay below each identifier's lockout.
    let mut failures = 0;
    'outer: for name in ["bob", "carol", "dave", "erin"] {
        for _ in 0..3 {
            if failures == 10 {
                break 'outer;
            }
            let challenge = f.auth.challenge(&ctx).await?;
            let outcome = f
                .auth
                .login(&LoginRequest::new(name, WRONG).with_captcha(&challenge.text), &ctx)
                .await?;
            assert_eq!(rejected(&outcome)?.code(), "invalid_credentials");
            failures += 1;
        }
    }

    assert!(f.auth.ip_list().is_denylisted("9.9.9.9").await);
    let outcome = f.auth.login(&LoginRequest::new("bob", PASSWORD), &ctx).await?;
    assert_eq!(rejected(&outcome)?, Rejection::IpBanned);
    assert!(f
        .audit
        .events()
        .iter()
        .any(|event| matches!(event, AuditEvent::AutoBanned { seconds: 3600, .. })));

    f.clock.advance(Duration::from_secs(3601));
    let outcome = f.auth.login(&LoginRequest::new("bob", PASSWORD), &ctx).await?;
    assert!(outcome.is_success());
    Ok(())
}

#[tokio::test]
async fn device_fingerprint_survives_address_change() -> Result<()> {
    let f = fixture().await?;
    let home = from("10.0.0.1");
    let office = from("172.16.0.9");
    assert_eq!(
        DeviceTracker::fingerprint(&home),
        DeviceTracker::fingerprint(&office)
    );

    let LoginOutcome::Success(first) = f.auth.login(&LoginRequest::new("carol", PASSWORD), &home).await?
    else {
        anyhow::bail!("first login rejected");
    };
    assert!(first.new_device);

    let LoginOutcome::Success(second) =
        f.auth.login(&LoginRequest::new("carol", PASSWORD), &office).await?
    else {
        anyhow::bail!("second login rejected");
    };
    assert!(!second.new_device);

    let phone = ClientContext::new("10.0.0.1").with_user_agent("Mobile Safari");
    let LoginOutcome::Success(third) = f.auth.login(&LoginRequest::new("carol", PASSWORD), &phone).await?
    else {
        anyhow::bail!("third login rejected");
    };
    assert!(third.new_device);
    Ok(())
}

#[tokio::test]
async fn disabled_account_is_refused_after_credentials() -> Result<()> {
    let f = fixture().await?;
    assert!(f.identity.set_active("dave", false).await);
    let outcome = f
        .auth
        .login(&LoginRequest::new("dave", PASSWORD), &from("10.1.1.1"))
        .await?;
    assert_eq!(rejected(&outcome)?, Rejection::AccountDisabled);
    Ok(())
}

#[tokio::test]
async fn challenge_is_one_shot() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let challenges = ChallengeManager::new(store);
    challenges.store("4821", "9.9.9.9").await?;
    assert!(challenges.verify("4821", "9.9.9.9").await);
    assert!(!challenges.verify("4821", "9.9.9.9").await);
    Ok(())
}

struct Rbac {
    clock: Arc<ManualClock>,
    resolver: Arc<RbacResolver>,
    admin: RbacAdmin,
    actor: Subject,
}

fn rbac() -> Rbac {
    let clock = Arc::new(ManualClock::fixed());
    let repo = Arc::new(MemoryRbacRepository::new());
    let cache = Arc::new(MemoryStore::with_clock(clock.clone()));
    let resolver = Arc::new(RbacResolver::new(repo.clone(), cache, clock.clone()));
    let admin = RbacAdmin::new(repo, resolver.clone(), clock.clone());
    Rbac {
        clock,
        resolver,
        admin,
        actor: Subject::superuser(1),
    }
}

async fn admin_role(rbac: &Rbac) -> Result<i64> {
    let read = rbac
        .admin
        .create_permission(NewPermission::new("Read users", "user:read"))
        .await?;
    let update = rbac
        .admin
        .create_permission(NewPermission::new("Update users", "user:update"))
        .await?;
    let role = rbac.admin.create_role(NewRole::new("Admin", "admin")).await?;
    rbac.admin
        .add_role_permissions(&rbac.actor, role.id, &[read.id, update.id])
        .await?;
    Ok(role.id)
}

#[tokio::test]
async fn role_grants_resolve_to_permissions() -> Result<()> {
    let rbac = rbac();
    let role_id = admin_role(&rbac).await?;
    let u1 = Subject::user(42);
    rbac.admin
        .assign_role(&rbac.actor, u1.user_id, role_id, None)
        .await?;

    let codes: BTreeSet<String> = rbac.resolver.permission_codes(&u1).await;
    assert_eq!(
        codes,
        BTreeSet::from(["user:read".to_string(), "user:update".to_string()])
    );
    assert!(rbac.resolver.has_permission(&u1, "user:update").await);
    assert!(!rbac.resolver.has_permission(&u1, "user:delete").await);
    Ok(())
}

#[tokio::test]
async fn expired_assignment_grants_nothing() -> Result<()> {
    let rbac = rbac();
    let role_id = admin_role(&rbac).await?;
    let u1 = Subject::user(42);
    let tomorrow = rbac.clock.now() + chrono::TimeDelta::days(1);
    rbac.admin
        .assign_role(&rbac.actor, u1.user_id, role_id, Some(tomorrow))
        .await?;
    assert_eq!(rbac.resolver.permission_codes(&u1).await.len(), 2);

    // Two days later the assignment is a day past its expiry.
    rbac.clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
    assert!(rbac.resolver.permissions_for(&u1, false).await.is_empty());
    assert!(rbac.resolver.roles_for(&u1, false).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn granted_permission_cannot_be_switched_off() -> Result<()> {
    let rbac = rbac();
    let role_id = admin_role(&rbac).await?;
    let u1 = Subject::user(42);
    rbac.admin
        .assign_role(&rbac.actor, u1.user_id, role_id, None)
        .await?;
    let read = rbac
        .admin
        .permission_tree()
        .await?
        .into_iter()
        .find(|node| node.code == "user:read")
        .context("user:read missing from tree")?;

    let update = PermissionUpdate {
        is_active: Some(false),
        ..PermissionUpdate::default()
    };
    let refused = rbac.admin.update_permission(&rbac.actor, read.id, update).await;
    assert!(matches!(refused, Err(RbacError::Validation(_))));
    assert!(rbac.resolver.has_permission(&u1, "user:read").await);
    Ok(())
}

#[tokio::test]
async fn superuser_holds_unregistered_permissions() {
    let rbac = rbac();
    assert!(
        rbac.resolver
            .has_permission(&Subject::superuser(7), "reports:export")
            .await
    );
    assert!(
        !rbac
            .resolver
            .has_permission(&Subject::user(7), "reports:export")
            .await
    );
}
