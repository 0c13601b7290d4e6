diesel::table! {
    audio_files (id) {
        id -> Integer,
        original_filename -> Text,
        stored_filename -> Text,
        content_type -> Text,
        file_path -> Text,
        user_id -> Integer,
        created_at -> Timestamp,
    }
}

diesel::table! {
    users (id) {
        id -> Integer,
        external_id -> Text,
        email -> Nullable<Text>,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        is_active -> Bool,
        is_superuser -> Bool,
        created_at -> Timestamp,
    }
}

diesel::joinable!(audio_files -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    audio_files,
    users,
);
