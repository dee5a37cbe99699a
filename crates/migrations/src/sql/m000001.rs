use indoc::indoc;

use super::PdoflowMigration;

pub const M000001_MIGRATION: PdoflowMigration = PdoflowMigration {
    number: 1,
    name: "m000001_postings_and_records",
    stmts: &[
        indoc! {r#"
            CREATE TABLE :PDOFLOW_SCHEMA.job_postings (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                poster text,
                target_function text NOT NULL,
                entry_point text NOT NULL,
                status text NOT NULL DEFAULT 'waiting'
                    CONSTRAINT valid_posting_status CHECK (
                        status IN ('waiting', 'executing', 'done', 'errored_out', 'paused', 'cancelled')
                    ),
                created_on timestamptz NOT NULL DEFAULT now()
            );
        "#},
        indoc! {r#"
            CREATE TABLE :PDOFLOW_SCHEMA.job_records (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                posting_id uuid NOT NULL
                    REFERENCES :PDOFLOW_SCHEMA.job_postings (id) ON DELETE CASCADE,
                priority int NOT NULL DEFAULT 0,
                positional_arguments jsonb NOT NULL DEFAULT '[]'::jsonb,
                keyword_arguments jsonb,
                tries_remaining int NOT NULL DEFAULT 3
                    CONSTRAINT no_negative_tries CHECK (tries_remaining >= 0),
                status text NOT NULL DEFAULT 'waiting'
                    CONSTRAINT valid_job_status CHECK (
                        status IN ('waiting', 'executing', 'done', 'errored_out', 'paused', 'cancelled')
                    ),
                exited_ok boolean,
                work_started_on timestamptz,
                completed_on timestamptz,
                created_on timestamptz NOT NULL DEFAULT now(),
                updated_on timestamptz NOT NULL DEFAULT now(),
                CONSTRAINT no_unphysical_completed
                    CHECK (completed_on IS NULL OR created_on <= completed_on),
                CONSTRAINT no_completion_before_start
                    CHECK (work_started_on IS NULL OR completed_on IS NULL
                           OR work_started_on <= completed_on)
            );
        "#},
        // Drives the claim SELECT: waiting rows in dispatch order.
        indoc! {r#"
            CREATE INDEX job_records_claim_idx
                ON :PDOFLOW_SCHEMA.job_records (priority DESC, created_on ASC)
                WHERE status = 'waiting';
        "#},
        // Drives per-posting aggregates and status rollups.
        indoc! {r#"
            CREATE INDEX job_records_posting_status_idx
                ON :PDOFLOW_SCHEMA.job_records (posting_id, status);
        "#},
    ],
};
