pub mod reconciliation_sweep;
