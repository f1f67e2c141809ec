pub mod reconciliation;
pub mod stk_push;
