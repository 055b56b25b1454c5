// Kept in sync with the CREATE TABLE batch in repository/migrations.rs.
// PRIMARY KEY columns are not nullable.

diesel::table! {
    sources (id) {
        id -> Text,
        source_type -> Text,
        name -> Text,
        base_url -> Text,
        is_active -> Integer,
        requests_per_minute -> Integer,
        requests_per_hour -> Integer,
        delay_between_requests_ms -> BigInt,
        headers -> Text,
        proxy -> Nullable<Text>,
        user_agent -> Nullable<Text>,
        search_url -> Nullable<Text>,
        created_at -> Text,
        last_crawled_at -> Nullable<Text>,
    }
}

diesel::table! {
    crawl_jobs (id) {
        id -> Text,
        source_id -> Text,
        kind -> Text,
        status -> Text,
        created_at -> Text,
        started_at -> Nullable<Text>,
        finished_at -> Nullable<Text>,
        processed -> Integer,
        total -> Integer,
        errors -> Integer,
        root_failed -> Integer,
    }
}

diesel::table! {
    crawl_job_logs (id) {
        id -> Integer,
        crawl_job_id -> Text,
        timestamp -> Text,
        level -> Text,
        message -> Text,
    }
}

diesel::table! {
    mangas (id) {
        id -> Text,
        source_id -> Text,
        source_manga_id -> Text,
        url -> Text,
        title -> Text,
        alt_titles -> Text,
        author -> Nullable<Text>,
        status -> Nullable<Text>,
        description -> Nullable<Text>,
        cover_url -> Nullable<Text>,
        genres -> Text,
        is_active -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    chapters (id) {
        id -> Text,
        manga_id -> Text,
        source_id -> Text,
        source_chapter_id -> Text,
        url -> Text,
        title -> Text,
        number -> Nullable<Double>,
        is_active -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    pages (id) {
        id -> Text,
        chapter_id -> Text,
        number -> Integer,
        image_url -> Text,
        is_downloaded -> Integer,
        local_path -> Nullable<Text>,
        content_hash -> Nullable<Text>,
        is_active -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    queued_commands (id) {
        id -> Integer,
        lane -> Text,
        command_type -> Text,
        payload -> Text,
        status -> Text,
        attempts -> Integer,
        max_attempts -> Integer,
        last_error -> Nullable<Text>,
        available_at_ms -> BigInt,
        locked_by -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::joinable!(crawl_jobs -> sources (source_id));
diesel::joinable!(crawl_job_logs -> crawl_jobs (crawl_job_id));
diesel::joinable!(mangas -> sources (source_id));
diesel::joinable!(chapters -> mangas (manga_id));
diesel::joinable!(pages -> chapters (chapter_id));

diesel::allow_tables_to_appear_in_same_query!(
    sources,
    crawl_jobs,
    crawl_job_logs,
    mangas,
    chapters,
    pages,
    queued_commands,
);
