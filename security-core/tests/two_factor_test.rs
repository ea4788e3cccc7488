mod common;

use chrono::Utc;
use security_core::services::{ServiceError, TwoFactorAuth};

fn current_code(secret: &str) -> String {
    TwoFactorAuth::generate_code_at(secret, Utc::now().timestamp() as u64).unwrap()
}

#[tokio::test]
async fn test_enrolment_and_login_challenge() {
    let app = common::TestApp::spawn();
    let two_factor = &app.core.two_factor;
    let editor = common::editor().key();

    let setup = two_factor.begin_setup("editor@example.com");
    assert_eq!(setup.secret.len(), 32);
    assert!(setup
        .provisioning_uri
        .starts_with("otpauth://totp/CMS:editor%40example.com?secret="));

    // Wrong confirmation code leaves 2FA off
    let err = two_factor.enable(editor, &setup.secret, "abcdef").await;
    assert!(matches!(err, Err(ServiceError::InvalidTwoFactorCode)));
    assert!(!two_factor.is_enabled(editor).await.unwrap());

    let codes = two_factor
        .enable(editor, &setup.secret, &current_code(&setup.secret))
        .await
        .unwrap();
    assert_eq!(codes.len(), 10);
    assert!(two_factor.is_enabled(editor).await.unwrap());

    assert!(two_factor.verify(editor, &current_code(&setup.secret)).await);
    assert!(!two_factor.verify(editor, "12345").await);

    let again = two_factor
        .enable(editor, &setup.secret, &current_code(&setup.secret))
        .await;
    assert!(matches!(again, Err(ServiceError::TwoFactorAlreadyEnabled)));
}

#[tokio::test]
async fn test_recovery_codes_are_single_use() {
    let app = common::TestApp::spawn();
    let two_factor = &app.core.two_factor;
    let editor = common::editor().key();

    let secret = TwoFactorAuth::generate_secret();
    let codes = two_factor
        .enable(editor, &secret, &current_code(&secret))
        .await
        .unwrap();

    assert!(two_factor.verify_recovery_code(editor, &codes[3]).await);
    assert!(!two_factor.verify_recovery_code(editor, &codes[3]).await);
    assert!(!two_factor.verify_recovery_code(editor, "AAAA-BBBB").await);
    assert_eq!(two_factor.remaining_recovery_codes(editor).await.unwrap(), 9);

    let fresh = two_factor.regenerate_recovery_codes(editor).await.unwrap();
    assert_eq!(fresh.len(), 10);
    assert!(!two_factor.verify_recovery_code(editor, &codes[0]).await);
    assert!(two_factor.verify_recovery_code(editor, &fresh[0]).await);
}

#[tokio::test]
async fn test_disable_and_outage() {
    let app = common::TestApp::spawn();
    let two_factor = &app.core.two_factor;
    let editor = common::editor().key();

    assert!(matches!(
        two_factor.disable(editor).await,
        Err(ServiceError::TwoFactorNotEnabled)
    ));

    let secret = TwoFactorAuth::generate_secret();
    two_factor
        .enable(editor, &secret, &current_code(&secret))
        .await
        .unwrap();

    app.store.set_unavailable(true);
    assert!(!two_factor.verify(editor, &current_code(&secret)).await);
    app.store.set_unavailable(false);

    two_factor.disable(editor).await.unwrap();
    assert!(!two_factor.is_enabled(editor).await.unwrap());
    assert!(!two_factor.verify(editor, &current_code(&secret)).await);
}
