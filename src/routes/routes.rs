//! HTTP surface of the engine.
//!
//! ## Structure
//! - **Spaces**
//!   - `GET    /spaces`: spaces the caller can read
//!   - `GET    /spaces-usage`: usage for every readable space
//!   - `PATCH  /spaces/{id}/quota`: set or clear a quota (manage)
//!
//! - **Files** (all under `/spaces/{id}`)
//!   - `GET    /browse?path=`, `GET /search?path=&q=`
//!   - `POST   /files/{mkdir,upload,rename,move,copy,delete,delete-multiple}`
//!   - `GET    /files/trash`, `POST /files/{trash-restore,trash-delete,trash-empty}`
//!   - `GET    /files/download?path=`, `POST /files/{download-multiple,download-ticket}`
//!
//! - **Tickets**: `GET /downloads/{token}`
//! - **WebDAV**: everything under `/webdav`, when enabled.

use crate::{
    adapters::webdav::{self, dav_handler},
    handlers::{
        file_handlers::{
            browse, copy_items, delete, delete_multiple, download, download_multiple,
            download_ticket, empty_trash, list_trash, mkdir, move_items, purge_trash,
            redeem_ticket, rename, restore_trash, search, upload,
        },
        health_handlers::{healthz, readyz},
        space_handlers::{list_spaces, spaces_usage, update_quota},
    },
    services::engine::SpaceEngine,
};
use axum::{
    Extension, Router,
    extract::DefaultBodyLimit,
    routing::{any, get, patch, post},
};

/// Build the router. State (`SpaceEngine`) is supplied by the caller.
pub fn routes(webdav_enabled: bool) -> Router<SpaceEngine> {
    let files = Router::new()
        .route("/browse", get(browse))
        .route("/search", get(search))
        .route("/files/mkdir", post(mkdir))
        .route(
            "/files/upload",
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/files/rename", post(rename))
        .route("/files/move", post(move_items))
        .route("/files/copy", post(copy_items))
        .route("/files/delete", post(delete))
        .route("/files/delete-multiple", post(delete_multiple))
        .route("/files/trash", get(list_trash))
        .route("/files/trash-restore", post(restore_trash))
        .route("/files/trash-delete", post(purge_trash))
        .route("/files/trash-empty", post(empty_trash))
        .route("/files/download", get(download))
        .route("/files/download-multiple", post(download_multiple))
        .route("/files/download-ticket", post(download_ticket))
        .route("/quota", patch(update_quota));

    let router = Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/spaces", get(list_spaces))
        .route("/spaces-usage", get(spaces_usage))
        .route("/downloads/{token}", get(redeem_ticket))
        .nest("/spaces/{id}", files);

    if !webdav_enabled {
        return router;
    }
    router
        .route(webdav::MOUNT, any(webdav::webdav))
        .route("/webdav/", any(webdav::webdav))
        .route("/webdav/{*path}", any(webdav::webdav))
        .layer(Extension(dav_handler()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::tests::{World, world};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
    };
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::fs;
    use tower::ServiceExt;

    fn app(w: &World) -> Router {
        routes(true).with_state(w.engine.clone())
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, basic("alice", "alicepw"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    enum Part<'a> {
        Field(&'a str, &'a str),
        File(&'a str, &'a [u8]),
    }

    const BOUNDARY: &str = "spacefs-upload-boundary";

    fn multipart_upload(uri: &str, user: (&str, &str), parts: &[Part]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Field(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(filename, content) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            filename
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(content);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::post(uri)
            .header(header::AUTHORIZATION, basic(user.0, user.1))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn requests_without_credentials_are_challenged() {
        let w = world().await;
        let response = app(&w)
            .oneshot(Request::get("/spaces").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let response = app(&w)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn browse_and_mkdir() {
        let w = world().await;
        fs::write(w.docs.root().join("a.txt"), "abc").unwrap();

        let response = app(&w)
            .oneshot(request(
                Method::POST,
                &format!("/spaces/{}/files/mkdir", w.docs.id),
                Some(json!({ "path": "/photos" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app(&w)
            .oneshot(request(
                Method::GET,
                &format!("/spaces/{}/browse?path=/", w.docs.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"photos"));
    }

    #[tokio::test]
    async fn forbidden_and_traversal_map_to_403() {
        let w = world().await;
        let response = app(&w)
            .oneshot(request(
                Method::POST,
                &format!("/spaces/{}/files/mkdir", w.media.id),
                Some(json!({ "path": "/nope" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(&w)
            .oneshot(request(
                Method::GET,
                &format!("/spaces/{}/browse?path=../../etc", w.docs.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["status"], 403);
    }

    #[tokio::test]
    async fn move_reports_per_item_outcome() {
        let w = world().await;
        fs::write(w.docs.root().join("a.txt"), "a").unwrap();
        fs::create_dir(w.docs.root().join("dest")).unwrap();
        fs::write(w.docs.root().join("dest/a.txt"), "old").unwrap();

        let response = app(&w)
            .oneshot(request(
                Method::POST,
                &format!("/spaces/{}/files/move", w.docs.id),
                Some(json!({
                    "sources": ["/a.txt", "/missing.txt"],
                    "destination": { "spaceId": w.docs.id, "path": "/dest" },
                    "conflictPolicy": "rename",
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["succeeded"], json!(["/a.txt"]));
        assert_eq!(body["failed"][0]["path"], "/missing.txt");
        assert!(w.docs.root().join("dest/a (1).txt").exists());
        assert_eq!(fs::read_to_string(w.docs.root().join("dest/a.txt")).unwrap(), "old");
    }

    #[tokio::test]
    async fn delete_then_restore_through_trash() {
        let w = world().await;
        fs::write(w.docs.root().join("keep.txt"), "k").unwrap();

        let response = app(&w)
            .oneshot(request(
                Method::POST,
                &format!("/spaces/{}/files/delete", w.docs.id),
                Some(json!({ "path": "/keep.txt" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!w.docs.root().join("keep.txt").exists());

        let response = app(&w)
            .oneshot(request(
                Method::GET,
                &format!("/spaces/{}/files/trash", w.docs.id),
                None,
            ))
            .await
            .unwrap();
        let trash = json_body(response).await;
        let id = trash[0]["id"].as_str().unwrap().to_string();
        assert_eq!(trash[0]["originalPath"], "/keep.txt");
        assert!(trash[0].get("storagePath").is_none());

        let response = app(&w)
            .oneshot(request(
                Method::POST,
                &format!("/spaces/{}/files/trash-restore", w.docs.id),
                Some(json!({ "ids": [id] })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(w.docs.root().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn ticket_is_single_use() {
        let w = world().await;
        fs::write(w.docs.root().join("report.txt"), "report").unwrap();

        let response = app(&w)
            .oneshot(request(
                Method::POST,
                &format!("/spaces/{}/files/download-ticket", w.docs.id),
                Some(json!({ "path": "/report.txt" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = json_body(response).await["token"].as_str().unwrap().to_string();

        let response = app(&w)
            .oneshot(request(Method::GET, &format!("/downloads/{}", token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"report");

        let response = app(&w)
            .oneshot(request(Method::GET, &format!("/downloads/{}", token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_follows_conflict_policy() {
        let w = world().await;
        fs::write(w.docs.root().join("a.txt"), "old").unwrap();
        let uri = format!("/spaces/{}/files/upload", w.docs.id);
        let alice = ("alice", "alicepw");

        let response = app(&w)
            .oneshot(multipart_upload(&uri, alice, &[Part::File("a.txt", b"new")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(fs::read_to_string(w.docs.root().join("a.txt")).unwrap(), "old");

        let response = app(&w)
            .oneshot(multipart_upload(
                &uri,
                alice,
                &[Part::Field("conflictPolicy", "skip"), Part::File("a.txt", b"new")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "skipped", "filename": "a.txt" })
        );

        let response = app(&w)
            .oneshot(multipart_upload(
                &uri,
                alice,
                &[Part::Field("conflictPolicy", "rename"), Part::File("a.txt", b"copy")],
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["filename"], "a (1).txt");
        assert_eq!(fs::read_to_string(w.docs.root().join("a (1).txt")).unwrap(), "copy");

        let response = app(&w)
            .oneshot(multipart_upload(
                &uri,
                alice,
                &[Part::Field("overwrite", "true"), Part::File("a.txt", b"new")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "uploaded", "filename": "a.txt" })
        );
        assert_eq!(fs::read_to_string(w.docs.root().join("a.txt")).unwrap(), "new");

        let response = app(&w)
            .oneshot(multipart_upload(
                &uri,
                alice,
                &[Part::Field("path", "/inbox"), Part::File("b.txt", b"b")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fs::read_to_string(w.docs.root().join("inbox/b.txt")).unwrap(), "b");
    }

    #[tokio::test]
    async fn upload_fields_after_the_file_are_not_applied() {
        let w = world().await;
        fs::write(w.docs.root().join("a.txt"), "old").unwrap();

        let response = app(&w)
            .oneshot(multipart_upload(
                &format!("/spaces/{}/files/upload", w.docs.id),
                ("alice", "alicepw"),
                &[Part::File("a.txt", b"new"), Part::Field("conflictPolicy", "overwrite")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(fs::read_to_string(w.docs.root().join("a.txt")).unwrap(), "old");

        let response = app(&w)
            .oneshot(multipart_upload(
                &format!("/spaces/{}/files/upload", w.docs.id),
                ("alice", "alicepw"),
                &[Part::Field("path", "/")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_may_fill_the_quota_exactly() {
        let w = world().await;
        let uri = format!("/spaces/{}/files/upload", w.media.id);
        let root = ("root", "rootpw");

        let response = app(&w)
            .oneshot(multipart_upload(&uri, root, &[Part::File("big.bin", &[7u8; 2000])]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert!(!w.media.root().join("big.bin").exists());

        let response = app(&w)
            .oneshot(multipart_upload(&uri, root, &[Part::File("full.bin", &[7u8; 1024])]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fs::metadata(w.media.root().join("full.bin")).unwrap().len(), 1024);

        let response = app(&w)
            .oneshot(multipart_upload(&uri, root, &[Part::File("one.bin", b"1")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert!(!w.media.root().join("one.bin").exists());
    }

    #[tokio::test]
    async fn webdav_root_lists_spaces() {
        let w = world().await;
        for uri in ["/webdav/", "/webdav"] {
            let response = app(&w)
                .oneshot(
                    Request::builder()
                        .method("PROPFIND")
                        .uri(uri)
                        .header(header::AUTHORIZATION, basic("alice", "alicepw"))
                        .header("Depth", "1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 207, "PROPFIND {}", uri);
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let text = String::from_utf8_lossy(&bytes);
            assert!(text.contains("/webdav/docs/"), "PROPFIND {}", uri);
            assert!(text.contains("/webdav/media/"), "PROPFIND {}", uri);
        }
    }
}
