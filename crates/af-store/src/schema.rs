//! Diesel table definitions for the Postgres-backed truth store.
//!
//! Enum-shaped columns (`role_type`, `state`, ...) are stored as `text` and
//! converted at the Rust boundary in `postgres.rs` rather than via a custom
//! `SqlType`/`ToSql`/`FromSql` impl per enum — one conversion function per
//! enum is simpler to audit than a diesel custom-type per enum.

diesel::table! {
    repos (repo_id) {
        repo_id -> Uuid,
        tenant_id -> Uuid,
        repo_key -> Text,
        repo_type -> Text,
        upstream_url -> Nullable<Text>,
        member_repo_keys -> Array<Text>,
    }
}

diesel::table! {
    tokens (token_id) {
        token_id -> Uuid,
        tenant_id -> Uuid,
        subject -> Text,
        token_hash -> Text,
        scopes -> Array<Text>,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        revoked_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    role_bindings (tenant_id, repo_id, subject) {
        tenant_id -> Uuid,
        repo_id -> Uuid,
        subject -> Text,
        roles -> Array<Text>,
    }
}

diesel::table! {
    upload_sessions (upload_id) {
        upload_id -> Uuid,
        tenant_id -> Uuid,
        repo_id -> Uuid,
        expected_digest -> Text,
        expected_length -> Int8,
        storage_upload_id -> Text,
        object_staging_key -> Text,
        state -> Text,
        created_by_subject -> Text,
        expires_at -> Timestamptz,
        committed_blob_digest -> Nullable<Text>,
        deduped -> Bool,
    }
}

diesel::table! {
    blobs (digest) {
        digest -> Text,
        length_bytes -> Int8,
        storage_key -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    package_versions (version_id) {
        version_id -> Uuid,
        tenant_id -> Uuid,
        repo_id -> Uuid,
        package_type -> Text,
        package_namespace -> Nullable<Text>,
        package_name -> Text,
        version -> Text,
        state -> Text,
        created_by_subject -> Text,
        published_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    artifact_entries (version_id, relative_path) {
        version_id -> Uuid,
        relative_path -> Text,
        blob_digest -> Text,
        size_bytes -> Int8,
    }
}

diesel::table! {
    manifests (version_id) {
        version_id -> Uuid,
        manifest_json -> Jsonb,
        manifest_blob_digest -> Nullable<Text>,
    }
}

diesel::table! {
    outbox_events (event_id) {
        event_id -> Uuid,
        tenant_id -> Uuid,
        aggregate_type -> Text,
        aggregate_id -> Text,
        event_type -> Text,
        payload_json -> Jsonb,
        available_at -> Timestamptz,
        occurred_at -> Timestamptz,
        delivered_at -> Nullable<Timestamptz>,
        claimed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    search_index_jobs (tenant_id, version_id) {
        tenant_id -> Uuid,
        version_id -> Uuid,
        status -> Text,
        attempts -> Int4,
        available_at -> Timestamptz,
        last_error -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tombstones (version_id) {
        version_id -> Uuid,
        reason -> Text,
        retention_until -> Timestamptz,
    }
}

diesel::table! {
    quarantine_items (quarantine_id) {
        quarantine_id -> Uuid,
        tenant_id -> Uuid,
        repo_id -> Uuid,
        version_id -> Uuid,
        status -> Text,
    }
}

diesel::table! {
    policy_evaluations (evaluation_id) {
        evaluation_id -> Uuid,
        version_id -> Uuid,
        action -> Text,
        decision -> Text,
        decision_source -> Text,
        reason -> Text,
        engine_version -> Nullable<Text>,
    }
}

diesel::table! {
    gc_runs (run_id) {
        run_id -> Uuid,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        deleted_version_count -> Int4,
        deleted_blob_count -> Int4,
    }
}

diesel::table! {
    audit_records (id) {
        id -> Int8,
        action -> Text,
        actor -> Text,
        resource_type -> Text,
        resource_id -> Text,
        details -> Jsonb,
        occurred_at -> Timestamptz,
    }
}
