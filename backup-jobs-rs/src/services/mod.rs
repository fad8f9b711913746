pub mod job_adopter;
