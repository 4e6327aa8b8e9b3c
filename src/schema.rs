// Database schema definitions
diesel::table! {
    app_user (id) {
        id -> Uuid,
        external_id -> Varchar,
        username -> Varchar,
        email -> Varchar,
        image_url -> Varchar,
        user_type -> Varchar,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    practice_session (id) {
        id -> Uuid,
        code -> Varchar,
        title -> Varchar,
        description -> Nullable<Text>,
        session_type -> Varchar,
        communication_modes -> Array<Text>,
        is_active -> Bool,
        creator_id -> Uuid,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    session_member (id) {
        id -> Uuid,
        user_id -> Uuid,
        session_id -> Uuid,
        role -> Varchar,
        is_banned -> Bool,
        joined_at -> Timestamp,
        left_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    message (id) {
        id -> Uuid,
        session_id -> Uuid,
        sender_id -> Uuid,
        content -> Nullable<Text>,
        media_url -> Nullable<Varchar>,
        media_type -> Nullable<Varchar>,
        created_at -> Timestamp,
    }
}

diesel::joinable!(practice_session -> app_user (creator_id));
diesel::joinable!(session_member -> app_user (user_id));
diesel::joinable!(session_member -> practice_session (session_id));
diesel::joinable!(message -> app_user (sender_id));
diesel::joinable!(message -> practice_session (session_id));

diesel::allow_tables_to_appear_in_same_query!(
    app_user, practice_session, session_member, message,
);
