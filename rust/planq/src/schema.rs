//! Diesel schema for the local snapshot catalog.

diesel::table! {
    use diesel::sql_types::*;

    cache_catalog (cache_key) {
        cache_key -> Text,
        snapshot_path -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}
