//! Admin and customer service action integration tests for billing-service.

mod common;

use billing_service::models::ServiceStatus;
use billing_service::provisioning::ServiceActions;
use billing_service::services::BillingError;
use chrono::Utc;
use std::time::Duration;

fn actions(ctx: &common::TestContext) -> ServiceActions {
    ServiceActions::new(ctx.db.clone(), ctx.dispatcher.clone())
}

#[tokio::test]
async fn concurrent_cancellation_is_not_overwritten() {
    let Some(ctx) = common::setup().await else {
        return;
    };
    let service = ctx.create_service(ServiceStatus::Active, "10.00").await;

    let mut tx = ctx.db.pool().begin().await.unwrap();
    ctx.db
        .find_service_for_update(&mut *tx, service.id)
        .await
        .unwrap();
    ctx.db
        .update_service_cancelled(&mut *tx, service.id, Some("invoice overdue"), Utc::now())
        .await
        .unwrap();

    let racing = {
        let actions = actions(&ctx);
        let service_id = service.id;
        tokio::spawn(async move {
            actions
                .update_status(service_id, ServiceStatus::Suspended, false, None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.commit().await.unwrap();

    let result = racing.await.unwrap();
    assert!(matches!(result, Err(BillingError::ServiceCancelled)));

    let service = ctx.service(service.id).await;
    assert_eq!(service.status(), Some(ServiceStatus::Cancelled));
    assert_eq!(service.cancellation_reason.as_deref(), Some("invoice overdue"));
}

#[tokio::test]
async fn cancelled_status_column_is_never_rewritten() {
    let Some(ctx) = common::setup().await else {
        return;
    };
    let service = ctx.create_service(ServiceStatus::Cancelled, "10.00").await;

    let updated = ctx
        .db
        .update_service_status(ctx.db.pool(), service.id, ServiceStatus::Active)
        .await
        .unwrap();

    assert!(!updated);
    assert_eq!(
        ctx.service(service.id).await.status(),
        Some(ServiceStatus::Cancelled)
    );
}

#[tokio::test]
async fn rejected_cancel_leaves_no_reason_behind() {
    let Some(ctx) = common::setup().await else {
        return;
    };
    let actions = actions(&ctx);
    let service = ctx.create_service(ServiceStatus::Active, "10.00").await;

    actions
        .perform_admin_action(service.id, "suspend")
        .await
        .unwrap();

    let result = actions
        .update_status(service.id, ServiceStatus::Cancelled, true, Some("abuse"))
        .await;
    assert!(matches!(result, Err(BillingError::ActionAlreadyRunning)));

    let service = ctx.service(service.id).await;
    assert_eq!(service.status(), Some(ServiceStatus::Active));
    assert_eq!(service.cancellation_reason, None);
    assert_eq!(service.cancelled_at, None);
}

#[tokio::test]
async fn direct_cancel_writes_status_and_reason_together() {
    let Some(ctx) = common::setup().await else {
        return;
    };
    let service = ctx.create_service(ServiceStatus::Active, "10.00").await;

    actions(&ctx)
        .update_status(service.id, ServiceStatus::Cancelled, false, Some("requested"))
        .await
        .unwrap();

    let service = ctx.service(service.id).await;
    assert_eq!(service.status(), Some(ServiceStatus::Cancelled));
    assert_eq!(service.cancellation_reason.as_deref(), Some("requested"));
    assert!(service.cancelled_at.is_some());
    assert!(ctx.queued_actions_for(service.id).is_empty());
}

#[tokio::test]
async fn admin_status_change_runs_the_matching_action() {
    let Some(ctx) = common::setup().await else {
        return;
    };
    let actions = actions(&ctx);
    let service = ctx.create_service(ServiceStatus::Active, "10.00").await;

    assert_eq!(
        actions.admin_actions(service.id).await.unwrap(),
        vec!["create", "suspend", "terminate"]
    );

    actions
        .update_status(service.id, ServiceStatus::Cancelled, true, Some("abuse"))
        .await
        .unwrap();

    let pending = ctx.service(service.id).await;
    assert_eq!(pending.status(), Some(ServiceStatus::Active));
    assert_eq!(pending.cancellation_reason.as_deref(), Some("abuse"));
    assert!(pending.cancelled_at.is_some());

    let queued = ctx.queued_actions_for(service.id);
    assert_eq!(queued[0].args["action"], "terminate");

    // The lock gates any further action until the terminate finishes.
    let second = actions.perform_admin_action(service.id, "suspend").await;
    assert!(matches!(second, Err(BillingError::ActionAlreadyRunning)));

    let unknown = actions.perform_client_action(common::OWNER, service.id, "format").await;
    assert!(matches!(unknown, Err(BillingError::InvalidAction(_))));

    let stranger = actions
        .perform_client_action(common::OWNER + 1, service.id, "reboot")
        .await;
    assert!(matches!(stranger, Err(BillingError::Forbidden)));
}

#[tokio::test]
async fn cancelled_service_offers_no_actions() {
    let Some(ctx) = common::setup().await else {
        return;
    };
    let actions = actions(&ctx);
    let service = ctx.create_service(ServiceStatus::Cancelled, "10.00").await;

    assert!(matches!(
        actions.client_actions(service.id).await,
        Err(BillingError::ServiceCancelled)
    ));
    assert!(matches!(
        actions.perform_admin_action(service.id, "create").await,
        Err(BillingError::ServiceCancelled)
    ));
    assert!(matches!(
        actions.admin_actions(-1).await,
        Err(BillingError::ServiceNotFound(-1))
    ));
}
