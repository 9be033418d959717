// Macros file - tracing macros are imported within the macro definitions

/// Standardized logging macros for consistent field names and message patterns across the application
///
/// These macros ensure:
/// - Consistent field naming conventions
/// - Appropriate logging levels for different scenarios
/// - Structured logging with context
/// - Consistent message formatting

// ============================================================================
// API Operation Logging Macros
// ============================================================================

/// Log the start of an API operation with consistent fields
#[macro_export]
macro_rules! log_api_start {
    ($operation:expr, student_id = $student_id:expr) => {
        tracing::debug!(
            operation = $operation,
            student_id = %$student_id,
            "API operation started"
        );
    };
    ($operation:expr, analysis_id = $analysis_id:expr) => {
        tracing::debug!(
            operation = $operation,
            analysis_id = %$analysis_id,
            "API operation started"
        );
    };
    ($operation:expr, class_name = $class_name:expr) => {
        tracing::debug!(
            operation = $operation,
            class_name = %$class_name,
            "API operation started"
        );
    };
    ($operation:expr) => {
        tracing::debug!(
            operation = $operation,
            "API operation started"
        );
    };
}

/// Log successful completion of an API operation
#[macro_export]
macro_rules! log_api_success {
    ($operation:expr, student_id = $student_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            student_id = %$student_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, analysis_id = $analysis_id:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            analysis_id = %$analysis_id,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, class_name = $class_name:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            class_name = %$class_name,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, count = $count:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            count = $count,
            "API operation completed: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::info!(
            operation = $operation,
            "API operation completed: {}", $msg
        );
    };
}

/// Log API operation errors with consistent structure
#[macro_export]
macro_rules! log_api_error {
    ($operation:expr, student_id = $student_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            student_id = %$student_id,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, analysis_id = $analysis_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            analysis_id = %$analysis_id,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, class_name = $class_name:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            class_name = %$class_name,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
    ($operation:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            error = %$error,
            "API operation failed: {}", $msg
        );
    };
}

/// Log API warnings with context
#[macro_export]
macro_rules! log_api_warn {
    ($operation:expr, student_id = $student_id:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            student_id = %$student_id,
            "API operation warning: {}", $msg
        );
    };
    ($operation:expr, class_name = $class_name:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            class_name = %$class_name,
            "API operation warning: {}", $msg
        );
    };
    ($operation:expr, $msg:expr) => {
        tracing::warn!(
            operation = $operation,
            "API operation warning: {}", $msg
        );
    };
}

// ============================================================================
// Engine Layer Logging Macros
// ============================================================================

/// Log engine operation start with context
#[macro_export]
macro_rules! log_engine_start {
    ($engine:expr, $operation:expr, record_count = $count:expr) => {
        tracing::info!(
            engine = $engine,
            operation = $operation,
            record_count = $count,
            "Engine operation started"
        );
    };
    ($engine:expr, $operation:expr, class_name = $class_name:expr) => {
        tracing::info!(
            engine = $engine,
            operation = $operation,
            class_name = %$class_name,
            "Engine operation started"
        );
    };
    ($engine:expr, $operation:expr) => {
        tracing::info!(
            engine = $engine,
            operation = $operation,
            "Engine operation started"
        );
    };
}

/// Log engine operation success
#[macro_export]
macro_rules! log_engine_success {
    ($engine:expr, $operation:expr, record_count = $count:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            engine = $engine,
            operation = $operation,
            record_count = $count,
            duration_ms = $duration,
            "Engine operation completed successfully"
        );
    };
    ($engine:expr, $operation:expr, $msg:expr) => {
        tracing::info!(
            engine = $engine,
            operation = $operation,
            "Engine operation completed: {}", $msg
        );
    };
}

/// Log engine operation errors
#[macro_export]
macro_rules! log_engine_error {
    ($engine:expr, $operation:expr, error = $error:expr) => {
        tracing::error!(
            engine = $engine,
            operation = $operation,
            error = %$error,
            "Engine operation failed"
        );
    };
}

/// Log engine warnings
#[macro_export]
macro_rules! log_engine_warn {
    ($engine:expr, $operation:expr, $msg:expr) => {
        tracing::warn!(
            engine = $engine,
            operation = $operation,
            "Engine warning: {}",
            $msg
        );
    };
}

// ============================================================================
// Database Operation Logging Macros
// ============================================================================

/// Log database operation performance and results
#[macro_export]
macro_rules! log_db_operation {
    (debug, $operation:expr, analysis_id = $analysis_id:expr, duration_ms = $duration:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            analysis_id = %$analysis_id,
            duration_ms = $duration,
            "Database operation completed"
        );
    };
    (debug, $operation:expr, count = $count:expr, duration_ms = $duration:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            result_count = $count,
            duration_ms = $duration,
            "Database operation completed"
        );
    };
    (info, $operation:expr, $msg:expr) => {
        tracing::info!(
            component = "database",
            operation = $operation,
            "Database operation: {}", $msg
        );
    };
    (error, $operation:expr, error = $error:expr) => {
        tracing::error!(
            component = "database",
            operation = $operation,
            error = %$error,
            "Database operation failed"
        );
    };
}

// ============================================================================
// Model Gateway Logging Macros
// ============================================================================

/// Log model gateway operations with provider context
#[macro_export]
macro_rules! log_llm_operation {
    (start, $operation:expr, provider = $provider:expr) => {
        tracing::info!(
            component = "model_gateway",
            operation = $operation,
            provider = %$provider,
            "LLM operation started"
        );
    };
    (success, $operation:expr, provider = $provider:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            component = "model_gateway",
            operation = $operation,
            provider = %$provider,
            duration_ms = $duration,
            "LLM operation completed successfully"
        );
    };
    (error, $operation:expr, provider = $provider:expr, error = $error:expr, attempt = $attempt:expr) => {
        tracing::error!(
            component = "model_gateway",
            operation = $operation,
            provider = %$provider,
            error = %$error,
            attempt = $attempt,
            "LLM operation failed"
        );
    };
    (warn, $operation:expr, $msg:expr) => {
        tracing::warn!(
            component = "model_gateway",
            operation = $operation,
            "LLM operation warning: {}", $msg
        );
    };
}

// ============================================================================
// System Event Logging Macros
// ============================================================================

/// Log system startup and shutdown events
#[macro_export]
macro_rules! log_system_event {
    (startup, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "startup",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (shutdown, component = $component:expr, $msg:expr) => {
        tracing::info!(
            event_type = "shutdown",
            component = $component,
            "System event: {}",
            $msg
        );
    };
    (config, $msg:expr) => {
        tracing::info!(event_type = "configuration", "System event: {}", $msg);
    };
}

// ============================================================================
// Validation Logging Macros
// ============================================================================

/// Log validation results consistently
#[macro_export]
macro_rules! log_validation {
    (success, $component:expr, $msg:expr) => {
        tracing::debug!(
            event_type = "validation",
            component = $component,
            result = "success",
            "Validation completed: {}", $msg
        );
    };
    (failure, $component:expr, error = $error:expr) => {
        tracing::warn!(
            event_type = "validation",
            component = $component,
            result = "failure",
            error = %$error,
            "Validation failed"
        );
    };
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    #[test]
    fn test_logging_macros_compile() {
        let student_id = Uuid::new_v4();
        let analysis_id = Uuid::new_v4();
        let error = anyhow::anyhow!("test error");

        // Test that all macro variants compile successfully
        log_api_start!("test_operation", student_id = student_id);
        log_api_start!("test_operation", analysis_id = analysis_id);
        log_api_start!("test_operation", class_name = "5th A");
        log_api_start!("test_operation");

        log_api_success!("test_operation", student_id = student_id, "operation completed");
        log_api_success!("test_operation", count = 5, "analyses processed");

        log_api_warn!("test_operation", class_name = "5th A", "operation warning");
        log_api_error!("test_operation", error = error, "operation failed");

        log_engine_start!("analysis_engine", "analyze_text", record_count = 5);
        log_engine_success!("analysis_engine", "analyze_text", "analysis produced");
        log_engine_warn!("grouping_engine", "generate_groups", "model output rejected");

        log_db_operation!(debug, "select_analysis", analysis_id = analysis_id, duration_ms = 10);
        log_db_operation!(info, "migration", "database initialized");

        log_llm_operation!(start, "generate_groups", provider = "groq");
        log_llm_operation!(
            success,
            "generate_groups",
            provider = "groq",
            duration_ms = 1500
        );

        log_system_event!(startup, component = "server", "server starting");
        log_system_event!(config, "configuration loaded successfully");

        log_validation!(success, "api_request", "request validated");
    }
}
