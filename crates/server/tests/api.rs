mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{PASSWORD, test_app};

#[tokio::test]
async fn health_reports_database_and_build_info() {
    let app = test_app(&[]).await;
    let response = app.request(Method::GET, "/v1/health", None, None).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["database_ready"], true);
    assert_eq!(response.body["version"], env!("CARGO_PKG_VERSION"));
    assert!(response.headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn signup_login_and_me() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme Inc", "owner@acme.test").await;

    let me = app.get("/v1/auth/me", &owner.token).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.data()["user"]["email"], "owner@acme.test");
    assert_eq!(me.data()["user"]["role"], "owner");
    assert!(me.data()["user"].get("password_hash").is_none());
    assert_eq!(me.data()["organization"]["slug"], "acme-inc");

    let again = app.login("OWNER@acme.test").await;
    assert_eq!(again.user_id, owner.user_id);

    let duplicate = app
        .request(
            Method::POST,
            "/v1/auth/signup",
            None,
            Some(json!({
                "organization_name": "Other",
                "name": "Someone",
                "email": "owner@acme.test",
                "password": PASSWORD,
            })),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(duplicate.body["error_code"], "CONFLICT");
}

#[tokio::test]
async fn auth_failures_use_error_envelope() {
    let app = test_app(&[]).await;
    app.signup("Acme", "owner@acme.test").await;

    let wrong_password = app
        .request(
            Method::POST,
            "/v1/auth/login",
            None,
            Some(json!({ "email": "owner@acme.test", "password": "nope-nope" })),
        )
        .await;
    assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password.body["success"], false);
    assert!(wrong_password.body["data"].is_null());
    assert_eq!(wrong_password.body["error_code"], "UNAUTHORIZED");

    let no_token = app.request(Method::GET, "/v1/feedback", None, None).await;
    assert_eq!(no_token.status, StatusCode::UNAUTHORIZED);

    let garbage = app.get("/v1/feedback", "not-a-jwt").await;
    assert_eq!(garbage.status, StatusCode::UNAUTHORIZED);

    let weak = app
        .request(
            Method::POST,
            "/v1/auth/signup",
            None,
            Some(json!({
                "organization_name": "Beta",
                "name": "B",
                "email": "b@beta.test",
                "password": "short",
            })),
        )
        .await;
    assert_eq!(weak.status, StatusCode::BAD_REQUEST);
    assert_eq!(weak.body["error_code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn organization_settings_require_manager() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme", "owner@acme.test").await;
    let member = app.add_user(&owner, "member@acme.test", "member").await;

    let forbidden = app
        .patch("/v1/organization", &member.token, json!({ "name": "Hacked" }))
        .await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    let updated = app
        .patch(
            "/v1/organization",
            &owner.token,
            json!({ "name": "Acme Corp", "settings": { "digest": "weekly" } }),
        )
        .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.data()["name"], "Acme Corp");
    assert_eq!(updated.data()["settings"]["digest"], "weekly");

    let read = app.get("/v1/organization", &member.token).await;
    assert_eq!(read.data()["name"], "Acme Corp");
}

#[tokio::test]
async fn last_owner_cannot_be_removed_or_demoted() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme", "owner@acme.test").await;
    let admin = app.add_user(&owner, "admin@acme.test", "admin").await;

    let demote = app
        .patch(
            &format!("/v1/users/{}", owner.user_id),
            &owner.token,
            json!({ "role": "admin" }),
        )
        .await;
    assert_eq!(demote.status, StatusCode::CONFLICT);

    let remove = app
        .delete(&format!("/v1/users/{}", owner.user_id), &owner.token)
        .await;
    assert_eq!(remove.status, StatusCode::CONFLICT);

    let admin_removes_owner = app
        .delete(&format!("/v1/users/{}", owner.user_id), &admin.token)
        .await;
    assert_eq!(admin_removes_owner.status, StatusCode::FORBIDDEN);

    // With a second owner the first can step down
    let promote = app
        .patch(
            &format!("/v1/users/{}", admin.user_id),
            &owner.token,
            json!({ "role": "owner" }),
        )
        .await;
    assert_eq!(promote.status, StatusCode::OK);
    let demote = app
        .patch(
            &format!("/v1/users/{}", owner.user_id),
            &owner.token,
            json!({ "role": "member" }),
        )
        .await;
    assert_eq!(demote.status, StatusCode::OK);
    assert_eq!(demote.data()["role"], "member");

    let users = app.get("/v1/users", &admin.token).await;
    assert_eq!(users.data().as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn members_cannot_manage_users() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme", "owner@acme.test").await;
    let member = app.add_user(&owner, "member@acme.test", "member").await;

    let invite = app
        .post(
            "/v1/users",
            &member.token,
            json!({ "email": "x@acme.test", "name": "X", "password": PASSWORD }),
        )
        .await;
    assert_eq!(invite.status, StatusCode::FORBIDDEN);

    let rename_self = app
        .patch(
            &format!("/v1/users/{}", member.user_id),
            &member.token,
            json!({ "name": "Renamed" }),
        )
        .await;
    assert_eq!(rename_self.status, StatusCode::OK);
    assert_eq!(rename_self.data()["name"], "Renamed");

    let promote_self = app
        .patch(
            &format!("/v1/users/{}", member.user_id),
            &member.token,
            json!({ "role": "admin" }),
        )
        .await;
    assert_eq!(promote_self.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn records_of_other_organizations_are_not_found() {
    let app = test_app(&[]).await;
    let acme = app.signup("Acme", "owner@acme.test").await;
    let globex = app.signup("Globex", "owner@globex.test").await;

    let customer = app
        .post(
            "/v1/customers",
            &acme.token,
            json!({ "email": "jane@example.com", "name": "Jane" }),
        )
        .await;
    assert_eq!(customer.status, StatusCode::CREATED);
    let customer_id = customer.data()["id"].as_str().unwrap().to_string();

    let feedback = app
        .post(
            "/v1/feedback",
            &acme.token,
            json!({ "title": "Dark mode", "customer_id": customer_id }),
        )
        .await;
    let feedback_id = feedback.data()["id"].as_str().unwrap().to_string();

    for uri in [
        format!("/v1/customers/{customer_id}"),
        format!("/v1/feedback/{feedback_id}"),
        format!("/v1/users/{}", acme.user_id),
    ] {
        let response = app.get(&uri, &globex.token).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(response.body["error_code"], "NOT_FOUND");
    }

    let delete = app
        .delete(&format!("/v1/feedback/{feedback_id}"), &globex.token)
        .await;
    assert_eq!(delete.status, StatusCode::NOT_FOUND);

    let foreign_customer = app
        .post(
            "/v1/feedback",
            &globex.token,
            json!({ "title": "Steal", "customer_id": customer_id }),
        )
        .await;
    assert_eq!(foreign_customer.status, StatusCode::NOT_FOUND);

    let listed = app.get("/v1/feedback", &globex.token).await;
    assert!(listed.data().as_array().unwrap().is_empty());
}

#[tokio::test]
async fn customer_crud() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme", "owner@acme.test").await;

    let created = app
        .post(
            "/v1/customers",
            &owner.token,
            json!({ "email": "Jane@Example.com", "name": "Jane", "company": "Initech" }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.data()["email"], "jane@example.com");
    let id = created.data()["id"].as_str().unwrap().to_string();

    let duplicate = app
        .post(
            "/v1/customers",
            &owner.token,
            json!({ "email": "jane@example.com" }),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let empty = app.post("/v1/customers", &owner.token, json!({})).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);

    let search = app.get("/v1/customers?search=initech", &owner.token).await;
    assert_eq!(search.data().as_array().unwrap().len(), 1);

    let updated = app
        .patch(
            &format!("/v1/customers/{id}"),
            &owner.token,
            json!({ "company": "Initrode" }),
        )
        .await;
    assert_eq!(updated.data()["company"], "Initrode");
    assert_eq!(updated.data()["name"], "Jane");

    app.post(
        "/v1/feedback",
        &owner.token,
        json!({ "title": "Faster exports", "customer_id": id }),
    )
    .await;
    let their_feedback = app
        .get(&format!("/v1/customers/{id}/feedback"), &owner.token)
        .await;
    assert_eq!(their_feedback.data().as_array().unwrap().len(), 1);

    let deleted = app
        .delete(&format!("/v1/customers/{id}"), &owner.token)
        .await;
    assert_eq!(deleted.status, StatusCode::OK);
    let gone = app.get(&format!("/v1/customers/{id}"), &owner.token).await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feedback_crud_and_filters() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme", "owner@acme.test").await;
    let member = app.add_user(&owner, "member@acme.test", "member").await;

    let created = app
        .post(
            "/v1/feedback",
            &member.token,
            json!({
                "title": "  Export to CSV ",
                "content": "Please",
                "priority": "high",
                "tags": ["reports"]
            }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.data()["title"], "Export to CSV");
    assert_eq!(created.data()["status"], "new");
    assert_eq!(created.data()["source"], "manual");
    let id = created.data()["id"].as_str().unwrap().to_string();

    app.post("/v1/feedback", &member.token, json!({ "title": "Dark mode" }))
        .await;

    let blank = app
        .post("/v1/feedback", &member.token, json!({ "title": "   " }))
        .await;
    assert_eq!(blank.status, StatusCode::BAD_REQUEST);

    let spoofed = app
        .post(
            "/v1/feedback",
            &member.token,
            json!({ "title": "Fake", "source": "zendesk", "source_id": "1" }),
        )
        .await;
    assert_eq!(spoofed.status, StatusCode::BAD_REQUEST);

    let high = app
        .get("/v1/feedback?priority=high", &member.token)
        .await;
    assert_eq!(high.data().as_array().unwrap().len(), 1);

    let search = app.get("/v1/feedback?search=dark", &member.token).await;
    assert_eq!(search.data()[0]["title"], "Dark mode");

    let updated = app
        .patch(
            &format!("/v1/feedback/{id}"),
            &member.token,
            json!({ "status": "planned" }),
        )
        .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.data()["status"], "planned");
    // Manual feedback is never synced outward
    assert!(updated.data()["metadata"].get("sync").is_none());

    let planned = app.get("/v1/feedback?status=planned", &member.token).await;
    assert_eq!(planned.data().as_array().unwrap().len(), 1);

    let deleted = app
        .delete(&format!("/v1/feedback/{id}"), &member.token)
        .await;
    assert_eq!(deleted.status, StatusCode::OK);
    let again = app
        .delete(&format!("/v1/feedback/{id}"), &member.token)
        .await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feedback_patch_can_clear_customer_and_category() {
    let app = test_app(&[]).await;
    let owner = app.signup("Acme", "owner@acme.test").await;

    let customer = app
        .post(
            "/v1/customers",
            &owner.token,
            json!({ "email": "jane@example.com", "name": "Jane" }),
        )
        .await;
    let customer_id = customer.data()["id"].as_str().unwrap().to_string();

    let created = app
        .post(
            "/v1/feedback",
            &owner.token,
            json!({ "title": "Bulk edit", "customer_id": customer_id, "category": "ux" }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let id = created.data()["id"].as_str().unwrap().to_string();

    let renamed = app
        .patch(
            &format!("/v1/feedback/{id}"),
            &owner.token,
            json!({ "title": "Bulk edit rows" }),
        )
        .await;
    assert_eq!(renamed.data()["category"], "ux");
    assert_eq!(renamed.data()["customer_id"], customer_id.as_str());

    let cleared = app
        .patch(
            &format!("/v1/feedback/{id}"),
            &owner.token,
            json!({ "category": null, "customer_id": null }),
        )
        .await;
    assert_eq!(cleared.status, StatusCode::OK);
    assert!(cleared.data()["category"].is_null());
    assert!(cleared.data()["customer_id"].is_null());
    assert_eq!(cleared.data()["title"], "Bulk edit rows");
}
