use super::*;

fn config() -> TokenConfig {
    TokenConfig {
        api_key: "devkey".into(),
        api_secret: "devsecret".into(),
        ttl_seconds: 600,
    }
}

#[test]
fn user_capabilities_scope_moderation_to_subscribe_only() {
    let caps = user_capabilities(&UserId::from("alice"));

    assert!(caps.allows("conversation:c1", Operation::Publish));
    assert!(caps.allows("conversation:c1", Operation::Presence));
    assert!(caps.allows("presence:c1", Operation::Subscribe));
    assert!(caps.allows("moderation:c1", Operation::Subscribe));
    assert!(!caps.allows("moderation:c1", Operation::Publish));
    assert!(!caps.allows("moderation:c1", Operation::Presence));
}

#[test]
fn coaching_channel_is_private_to_its_user() {
    let caps = user_capabilities(&UserId::from("alice"));

    assert!(caps.allows("coaching:alice:c1", Operation::Publish));
    assert!(caps.allows("coaching:alice:c1", Operation::Subscribe));
    assert!(!caps.allows("coaching:alice:c1", Operation::Presence));
    assert!(!caps.allows("coaching:bob:c1", Operation::Subscribe));
}

#[test]
fn exact_patterns_do_not_match_prefixes() {
    let caps = CapabilitySet::new().grant("lobby", &[Operation::Subscribe]);
    assert!(caps.allows("lobby", Operation::Subscribe));
    assert!(!caps.allows("lobby:extra", Operation::Subscribe));
}

#[test]
fn ttl_is_clamped_to_bounds() {
    let mut cfg = config();
    cfg.ttl_seconds = 5;
    assert_eq!(cfg.effective_ttl_seconds(), MIN_TOKEN_TTL_SECONDS);
    cfg.ttl_seconds = 10 * MAX_TOKEN_TTL_SECONDS;
    assert_eq!(cfg.effective_ttl_seconds(), MAX_TOKEN_TTL_SECONDS);
}

#[test]
fn token_claims_contain_subject_and_capabilities() {
    let cfg = config();
    let caps = user_capabilities(&UserId::from("u7"));
    let issued = mint_token(&cfg, &UserId::from("u7"), &caps).expect("token");

    let claims = verify_token(&cfg, &issued.token).expect("verify");
    assert_eq!(claims.iss, "devkey");
    assert_eq!(claims.sub, "user:u7");
    assert_eq!(claims.exp - claims.iat, 600);
    assert_eq!(claims.capability, caps);
    assert_eq!(issued.expires_at.timestamp(), claims.exp);
}

#[test]
fn token_signed_with_other_secret_is_rejected() {
    let cfg = config();
    let issued = mint_token(&cfg, &UserId::from("u7"), &CapabilitySet::new()).expect("token");

    let mut other = config();
    other.api_secret = "not-the-secret".into();
    assert!(verify_token(&other, &issued.token).is_err());
}

#[tokio::test]
async fn jwt_issuer_issues_verifiable_tokens() {
    let issuer = JwtTokenIssuer::new(config());
    let caps = user_capabilities(&UserId::from("u1"));
    let issued = issuer
        .issue(&UserId::from("u1"), &caps)
        .await
        .expect("issue");
    let claims = verify_token(&config(), &issued.token).expect("verify");
    assert!(claims
        .capability
        .patterns()
        .any(|pattern| pattern == "coaching:u1:*"));
}
