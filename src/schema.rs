diesel::table! {
    datasets (slug) {
        slug -> Text,
        name -> Text,
        original_filename -> Text,
        table_name -> Text,
        status -> Text,
        error_message -> Text,
        row_count -> BigInt,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    dataset_columns (dataset_slug, position) {
        dataset_slug -> Text,
        position -> Integer,
        name -> Text,
        field_name -> Text,
        data_type -> Text,
        nullable -> Bool,
        is_unique -> Bool,
        max_length -> Nullable<Integer>,
        sample_values -> Text,
    }
}

diesel::joinable!(dataset_columns -> datasets (dataset_slug));

diesel::allow_tables_to_appear_in_same_query!(datasets, dataset_columns);
