use indoc::indoc;

use super::PdoflowMigration;

pub const M000002_MIGRATION: PdoflowMigration = PdoflowMigration {
    number: 2,
    name: "m000002_execution_profiles",
    stmts: &[
        indoc! {r#"
            CREATE TABLE :PDOFLOW_SCHEMA.job_profiles (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                job_record_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.job_records (id) ON DELETE CASCADE,
                total_calls bigint NOT NULL,
                total_time double precision NOT NULL,
                created_on timestamptz NOT NULL DEFAULT now()
            );
        "#},
        // Shared across profiles, content-addressed by the source tuple.
        indoc! {r#"
            CREATE TABLE :PDOFLOW_SCHEMA.function_defs (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                filename text NOT NULL,
                line_number int NOT NULL,
                function_name text NOT NULL,
                created_on timestamptz NOT NULL DEFAULT now(),
                CONSTRAINT unique_function_site UNIQUE (filename, line_number, function_name)
            );
        "#},
        indoc! {r#"
            CREATE TABLE :PDOFLOW_SCHEMA.function_stats (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                profile_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.job_profiles (id) ON DELETE CASCADE,
                function_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.function_defs (id) ON DELETE CASCADE,
                n_calls bigint NOT NULL,
                primitive_calls bigint NOT NULL,
                total_time double precision NOT NULL,
                cumulative_time double precision NOT NULL,
                created_on timestamptz NOT NULL DEFAULT now()
            );
        "#},
        indoc! {r#"
            CREATE TABLE :PDOFLOW_SCHEMA.function_call_map (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                profile_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.job_profiles (id) ON DELETE CASCADE,
                caller_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.function_defs (id) ON DELETE CASCADE,
                callee_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.function_defs (id) ON DELETE CASCADE,
                n_calls bigint NOT NULL
            );
        "#},
        indoc! {r#"
            CREATE INDEX function_stats_profile_idx
                ON :PDOFLOW_SCHEMA.function_stats (profile_id);
        "#},
        indoc! {r#"
            CREATE INDEX function_call_map_profile_idx
                ON :PDOFLOW_SCHEMA.function_call_map (profile_id);
        "#},
    ],
};
