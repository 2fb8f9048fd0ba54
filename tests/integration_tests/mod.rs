mod spmd;
